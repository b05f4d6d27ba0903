//! Application messages carried over the data channel.
//!
//! Each message is one JSON object tagged by `type`; one send is one whole
//! editor event, so no framing is needed.

use serde::{Deserialize, Serialize};

pub const MIN_FONT_SIZE: u32 = 10;
pub const MAX_FONT_SIZE: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppMessage {
    ContentUpdate {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        cursor_position: usize,
        selection_start: usize,
        selection_end: usize,
        has_selection: bool,
    },
    #[serde(rename_all = "camelCase")]
    FontSizeUpdate {
        font_size: u32,
    },
    #[serde(rename_all = "camelCase")]
    FontUpdate {
        is_noto_font: bool,
    },
    #[serde(rename_all = "camelCase")]
    DarkModeUpdate {
        is_dark_mode: bool,
    },
    /// A `type` this build does not know; receivers ignore it.
    #[serde(other)]
    Unknown,
}

impl AppMessage {
    pub fn content(content: impl Into<String>) -> Self {
        Self::ContentUpdate {
            content: content.into(),
        }
    }

    /// Cursor message for a selection range; a collapsed range is a caret.
    pub fn cursor(start: usize, end: usize) -> Self {
        Self::CursorUpdate {
            cursor_position: start,
            selection_start: start,
            selection_end: end,
            has_selection: start != end,
        }
    }

    pub fn font_size(size: u32) -> Self {
        Self::FontSizeUpdate {
            font_size: size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_wire_shape() {
        let v = serde_json::to_value(AppMessage::cursor(3, 7)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "cursorUpdate",
                "cursorPosition": 3,
                "selectionStart": 3,
                "selectionEnd": 7,
                "hasSelection": true
            })
        );
    }

    #[test]
    fn caret_has_no_selection() {
        assert!(matches!(
            AppMessage::cursor(5, 5),
            AppMessage::CursorUpdate {
                has_selection: false,
                ..
            }
        ));
    }

    #[test]
    fn parses_browser_payloads() {
        let m = AppMessage::from_json(r#"{"type":"darkModeUpdate","isDarkMode":true}"#).unwrap();
        assert_eq!(m, AppMessage::DarkModeUpdate { is_dark_mode: true });

        let m = AppMessage::from_json(r#"{"type":"fontUpdate","isNotoFont":false}"#).unwrap();
        assert_eq!(m, AppMessage::FontUpdate { is_noto_font: false });

        let m = AppMessage::from_json(r#"{"type":"contentUpdate","content":"hi"}"#).unwrap();
        assert_eq!(m, AppMessage::content("hi"));
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let m = AppMessage::from_json(r#"{"type":"selectionUpdate","x":1}"#).unwrap();
        assert_eq!(m, AppMessage::Unknown);
    }

    #[test]
    fn font_size_is_clamped() {
        assert_eq!(AppMessage::font_size(40), AppMessage::FontSizeUpdate { font_size: 24 });
        assert_eq!(AppMessage::font_size(2), AppMessage::FontSizeUpdate { font_size: 10 });
    }
}
