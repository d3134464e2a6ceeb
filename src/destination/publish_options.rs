use std::time::Duration;

use crate::broker::{PublishOption, PublishOptions};

/// Translate retry settings into publish options.
///
/// A zero wait or zero attempt count leaves that option out, so the broker
/// client falls back to its own default.
pub fn publish_options(retry_wait: Duration, retry_attempts: u32) -> PublishOptions {
    let mut options = Vec::new();

    if !retry_wait.is_zero() {
        options.push(PublishOption::RetryWait(retry_wait));
    }

    if retry_attempts != 0 {
        options.push(PublishOption::RetryAttempts(retry_attempts));
    }

    PublishOptions::new(options)
}
