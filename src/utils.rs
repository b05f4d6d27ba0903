use crate::peer::types::ServerConfig;
use rand::Rng;

/// Process-local participant token, e.g. `user_3fa9c01b22d4e87a`.
pub fn random_id() -> String {
    format!("user_{}", hex::encode(rand::rng().random::<[u8; 8]>()))
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Prefix an ICE server URL with its scheme when the user left it out.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = random_id();
        let b = random_id();
        assert_ne!(a, b);
        assert!(a.starts_with("user_"));
        assert_eq!(a.len(), "user_".len() + 16);
    }

    #[test]
    fn scheme_added_by_type() {
        let mut s = ServerConfig::stun("x", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&s), "stun:stun.example.org:3478");

        s.r#type = "turn".into();
        assert_eq!(add_ice_url_scheme(&s), "turn:stun.example.org:3478");

        s.url = "turns:relay.example.org:5349".into();
        assert_eq!(add_ice_url_scheme(&s), "turns:relay.example.org:5349");
    }
}
