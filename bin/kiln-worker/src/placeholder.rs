//! Stand-in generation backends.
//!
//! Real vendor integrations are provided by the embedding application; the
//! worker host ships one placeholder per kind so the pipeline runs end to
//! end before those integrations exist. Each placeholder sleeps for a
//! delay roughly scaled to its content kind and returns a fixed sample
//! artifact.

use std::time::Duration;

use async_trait::async_trait;

use kiln_core::{GenerateError, GenerationBackend, JobKind, JobSpec};

pub struct PlaceholderBackend {
    kind: JobKind,
    delay: Duration,
}

impl PlaceholderBackend {
    pub fn new(kind: JobKind) -> Self {
        let delay = match kind {
            JobKind::Text => Duration::from_millis(200),
            JobKind::Image | JobKind::Voice => Duration::from_millis(500),
            JobKind::Video => Duration::from_secs(2),
        };
        Self { kind, delay }
    }
}

#[async_trait]
impl GenerationBackend for PlaceholderBackend {
    async fn generate(&self, _spec: &JobSpec) -> Result<String, GenerateError> {
        tokio::time::sleep(self.delay).await;
        let artifact = match self.kind {
            JobKind::Text => "https://samples.kiln.example/text/lorem.txt",
            JobKind::Image => "https://samples.kiln.example/image/placeholder.png",
            JobKind::Voice => "https://samples.kiln.example/voice/placeholder.mp3",
            JobKind::Video => "https://samples.kiln.example/video/big_buck_bunny_720p_1mb.mp4",
        };
        Ok(artifact.to_owned())
    }
}
