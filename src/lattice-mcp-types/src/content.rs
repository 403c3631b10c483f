//! Content items carried by tool results and prompt messages.

use serde::{Deserialize, Serialize};

use crate::catalog::ResourceContent;

/// A single content item.
///
/// Item types this client does not interpret (audio, resource links, ...)
/// deserialize as [`Content::Other`] instead of failing the whole result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Content {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Image content.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource.
    Resource {
        /// The resource content.
        resource: ResourceContent,
    },
    /// Any other content type.
    #[serde(other)]
    Other,
}

impl Content {
    /// Create text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get as text if this is text content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Wire name of the content type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Resource { .. } => "resource",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_content_type_is_tolerated() {
        let items: Vec<Content> = serde_json::from_value(json!([
            {"type": "text", "text": "hi"},
            {"type": "audio", "data": "AAAA", "mimeType": "audio/wav"}
        ]))
        .expect("content should parse");

        assert_eq!(items[0].as_text(), Some("hi"));
        assert_eq!(items[1], Content::Other);
        assert_eq!(items[1].kind(), "other");
    }

    #[test]
    fn test_image_uses_mime_type_key() {
        let image = Content::Image {
            data: "base64".into(),
            mime_type: "image/png".into(),
        };
        let json = serde_json::to_value(&image).expect("serialize");
        assert_eq!(json["type"], "image");
        assert_eq!(json["mimeType"], "image/png");
    }
}
