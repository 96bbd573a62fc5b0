use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An image attached to a client message, already base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

/// One structured user message, as pulled from the message queue by an agent
/// driver.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PromptMessage {
    pub content: Vec<PromptPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        media_type: String,
        data: String,
    },
}

impl PromptMessage {
    /// Builds the initial (or mid-turn) user message: image parts first, then
    /// the text if any, matching what agent drivers expect.
    pub fn from_user_input(text: &str, images: &[ImageAttachment]) -> Self {
        let mut content = Vec::with_capacity(images.len() + 1);
        for image in images {
            content.push(PromptPart::Image {
                media_type: image.media_type.clone(),
                data: image.data.clone(),
            });
        }
        if !text.is_empty() {
            content.push(PromptPart::Text {
                text: text.to_string(),
            });
        }
        Self { content }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                PromptPart::Text { text } => Some(text.as_str()),
                PromptPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_input_orders_images_before_text() {
        let images = vec![ImageAttachment {
            media_type: "image/png".to_string(),
            data: "aGk=".to_string(),
        }];
        let message = PromptMessage::from_user_input("look at this", &images);
        assert_eq!(message.content.len(), 2);
        assert!(matches!(message.content[0], PromptPart::Image { .. }));
        assert_eq!(message.text(), "look at this");
    }

    #[test]
    fn empty_text_is_omitted() {
        let message = PromptMessage::from_user_input("", &[]);
        assert!(message.content.is_empty());
    }
}
