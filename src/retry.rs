//! Bounded polling for resources that appear asynchronously (modules the
//! loader has not mapped yet).

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::err::{Error, Result};
use crate::module::{ModuleResolver, SectionDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Calls `probe` until it yields a value, sleeping `interval` between
    /// attempts. Gives up with [`Error::NeverAvailable`] after `max_attempts`.
    pub fn poll<T>(&self, what: &str, mut probe: impl FnMut() -> Option<T>) -> Result<T> {
        let mut attempts = 0u32;
        loop {
            if attempts >= self.max_attempts {
                warn!("{} never became available ({} attempts)", what, attempts);
                return Err(Error::NeverAvailable {
                    what: what.to_string(),
                    attempts,
                });
            }
            attempts += 1;

            if let Some(value) = probe() {
                if attempts > 1 {
                    debug!("{} available after {} attempts", what, attempts);
                }
                return Ok(value);
            }
            thread::sleep(self.interval);
        }
    }
}

/// Waits until `module` is loaded and reports a non-empty `section`.
pub fn wait_for_section(
    resolver: &impl ModuleResolver,
    module: &str,
    section: &str,
    policy: &RetryPolicy,
) -> Result<SectionDescriptor> {
    let what = format!("{}:{}", module, section);
    let found = policy.poll(&what, || {
        let desc = resolver.section(module, section);
        (!desc.is_empty()).then_some(desc)
    })?;
    info!(
        "{} at {:#x}, {:#x} bytes",
        what,
        found.base(),
        found.size()
    );
    Ok(found)
}
