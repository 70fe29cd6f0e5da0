//! Credit tariff for generation work.

use crate::pipeline::types::{JobKind, JobSpec, PipelineError};

/// Fixed price table keyed by job kind and variant.
///
/// Every field has the standard tariff as its default, so deployments only
/// override what they re-price.
#[derive(Debug, Clone)]
pub struct PriceTable {
    pub text: i64,
    pub text_ideas: i64,
    pub text_caption: i64,
    pub image: i64,
    pub voice: i64,
    pub video_social_media: i64,
    pub video_product_showcase: i64,
    pub video_commercial: i64,
}

impl PriceTable {
    /// The standard tariff.
    pub fn standard() -> Self {
        Self {
            text: 1,
            text_ideas: 3,
            text_caption: 2,
            image: 5,
            voice: 2,
            video_social_media: 20,
            video_product_showcase: 30,
            video_commercial: 50,
        }
    }

    /// Credits charged for a spec.
    ///
    /// Unknown text variants fall back to the base text price. Video
    /// variants are mandatory: the spread between video tariffs is too
    /// wide for a silent default.
    pub fn price(&self, kind: JobKind, spec: &JobSpec) -> Result<i64, PipelineError> {
        let credits = match kind {
            JobKind::Text => match spec.variant.as_deref() {
                Some("ideas") => self.text_ideas,
                Some("caption") => self.text_caption,
                _ => self.text,
            },
            JobKind::Image => self.image,
            JobKind::Voice => self.voice,
            JobKind::Video => match spec.variant.as_deref() {
                Some("social_media") => self.video_social_media,
                Some("product_showcase") => self.video_product_showcase,
                Some("commercial") => self.video_commercial,
                Some(other) => {
                    return Err(PipelineError::InvalidSpec {
                        kind,
                        reason: format!("unknown video variant '{other}'"),
                    });
                }
                None => {
                    return Err(PipelineError::InvalidSpec {
                        kind,
                        reason: "video variant is required".to_owned(),
                    });
                }
            },
        };
        Ok(credits)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::standard()
    }
}
