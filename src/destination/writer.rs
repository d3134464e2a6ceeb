use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{publish_options, Result, WriteError};
use crate::broker::{Connection, PublishOptions, StreamContext};
use crate::record::Record;

/// Parameters for [`Writer::new`].
#[derive(Debug, Clone)]
pub struct WriterParams {
    /// Subject to publish to.
    pub subject: String,
    /// Records per publish. Only 1 is supported.
    pub batch_size: usize,
    /// Wait between publish attempts. Zero uses the broker default.
    pub retry_wait: Duration,
    /// Retries after the first attempt. Zero uses the broker default.
    pub retry_attempts: u32,
}

/// Publishes records to a JetStream subject.
///
/// Each write waits for the stream to acknowledge the message. Retries are
/// left to the broker client, driven by the options built from
/// [`WriterParams`].
pub struct Writer {
    connection: Mutex<Option<Box<dyn Connection>>>,
    context: Arc<dyn StreamContext>,
    subject: String,
    batch_size: usize,
    options: PublishOptions,
}

impl Writer {
    pub fn new(connection: Box<dyn Connection>, params: WriterParams) -> Result<Self> {
        let context = connection.stream_context()?;
        let options = publish_options(params.retry_wait, params.retry_attempts);

        info!(
            subject = %params.subject,
            batch_size = params.batch_size,
            retry_wait_ms = params.retry_wait.as_millis() as u64,
            retry_attempts = params.retry_attempts,
            "Writer ready"
        );

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            context,
            subject: params.subject,
            batch_size: params.batch_size,
            options,
        })
    }

    /// Options attached to every publish.
    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    /// Publish `record.payload.after` to the configured subject.
    ///
    /// Fails with [`WriteError::NotImplemented`] when the batch size is above
    /// one; batched publishing does not exist yet.
    pub async fn write(&self, record: &Record) -> Result<()> {
        if self.batch_size > 1 {
            return Err(WriteError::NotImplemented {
                batch_size: self.batch_size,
            });
        }

        self.context
            .publish(&self.subject, record.payload.after.clone(), &self.options)
            .await
            .map_err(WriteError::Publish)?;

        debug!(
            subject = %self.subject,
            bytes = record.payload.after.len(),
            "Published record"
        );

        Ok(())
    }

    /// Close the underlying connection. Later calls do nothing.
    pub async fn close(&self) -> Result<()> {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await?;
            info!(subject = %self.subject, "Writer closed");
        }

        Ok(())
    }
}
