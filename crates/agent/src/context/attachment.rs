//! Turn input and attachment validation.

use base64::Engine;
use grantwell_core::error::ValidationError;
use grantwell_core::message::{Block, ContentBlock};
use serde::{Deserialize, Serialize};

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const DOCUMENT_TYPES: &[&str] = &["application/pdf", "text/plain"];

/// A file sent alongside the user's text, base64-encoded.
///
/// `kind` is kept as a plain string so an unsupported kind is reported as a
/// validation error instead of a deserialisation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub media_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            media_type: media_type.into(),
            data: data.into(),
            name: None,
        }
    }

    pub fn document(
        media_type: impl Into<String>,
        data: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            kind: "document".into(),
            media_type: media_type.into(),
            data: data.into(),
            name,
        }
    }

    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let allowed = match self.kind.as_str() {
            "image" => IMAGE_TYPES,
            "document" => DOCUMENT_TYPES,
            other => return Err(ValidationError::UnsupportedAttachmentKind(other.to_string())),
        };
        if !allowed.contains(&self.media_type.as_str()) {
            return Err(ValidationError::UnsupportedMediaType {
                kind: self.kind.clone(),
                media_type: self.media_type.clone(),
            });
        }
        if self.data.trim().is_empty() {
            return Err(ValidationError::EmptyAttachment { index });
        }
        base64::engine::general_purpose::STANDARD
            .decode(self.data.trim())
            .map_err(|e| ValidationError::InvalidEncoding {
                index,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn into_block(self) -> ContentBlock {
        let data = self.data.trim().to_string();
        match self.kind.as_str() {
            "image" => ContentBlock::Image {
                media_type: self.media_type,
                data,
            },
            _ => ContentBlock::Document {
                media_type: self.media_type,
                data,
                name: self.name,
            },
        }
    }
}

/// What the user sent for this turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnInput {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    /// Check every attachment, then that the turn carries something at all.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (index, attachment) in self.attachments.iter().enumerate() {
            attachment.validate(index)?;
        }
        if self.text.trim().is_empty() && self.attachments.is_empty() {
            return Err(ValidationError::EmptyTurn);
        }
        Ok(())
    }

    /// The user message content: attachments first, then text.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        let mut blocks: Vec<ContentBlock> = self
            .attachments
            .into_iter()
            .map(Attachment::into_block)
            .collect();
        if !self.text.trim().is_empty() {
            blocks.push(ContentBlock::text(self.text));
        }
        blocks
    }
}

pub(crate) fn to_context_blocks(blocks: &[ContentBlock]) -> Vec<Block> {
    blocks.iter().cloned().map(Block::Persistable).collect()
}
