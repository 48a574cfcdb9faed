//! KS-045: Deferred stdout transport.
//!
//! Prints the consolidated prompt and always defers. The caller reports
//! "answers required" (exit code 2) and pass 2 is a later invocation with an
//! answers file.

use super::{AiRequest, Resolution, Transport, TransportKind};
use crate::ai::prompt;
use crate::error::AiError;
use async_trait::async_trait;
use std::path::PathBuf;

pub struct StdoutTransport {
    template: Option<PathBuf>,
    print: bool,
}

impl StdoutTransport {
    pub fn new(template: Option<PathBuf>) -> Self {
        Self {
            template,
            print: true,
        }
    }

    /// Render without printing; the prompt is still returned in the deferral.
    pub fn quiet(mut self) -> Self {
        self.print = false;
        self
    }

    /// The text this transport emits for a request.
    pub fn render(&self, request: &AiRequest) -> Result<String, AiError> {
        match self.template {
            Some(ref path) => prompt::assemble_with_template(path, &request.entries),
            None => Ok(request.prompt.clone()),
        }
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdout
    }

    async fn resolve(&self, request: &AiRequest) -> Result<Resolution, AiError> {
        let prompt = self.render(request)?;
        if self.print {
            println!("{}", prompt);
        }
        Ok(Resolution::Deferred { prompt })
    }
}
