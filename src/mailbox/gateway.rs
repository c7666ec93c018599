//! Rate-limited, retrying wrapper around a [`MailboxClient`].

use std::sync::Arc;

use crate::error::{Result, StripError};
use crate::model::message::SearchCriteria;

use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use super::{MailboxClient, SearchResults};

/// Hook invoked before each retry with the upcoming attempt number.
pub type RetryHook<'h> = &'h mut dyn FnMut(u32, &StripError) -> Result<()>;

/// Every mailbox call made by the engine goes through here.
///
/// Each attempt takes one token from the shared bucket; transient failures
/// are retried per the policy and never leave the gateway unless the policy
/// gives up.
#[derive(Clone)]
pub struct MailboxGateway {
    client: Arc<dyn MailboxClient>,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl MailboxGateway {
    pub fn new(client: Arc<dyn MailboxClient>, retry: RetryPolicy, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            retry,
            limiter,
        }
    }

    /// No rate limit, immediate retries.
    pub fn unthrottled(client: Arc<dyn MailboxClient>) -> Self {
        Self::new(
            client,
            RetryPolicy::immediate(3),
            Arc::new(RateLimiter::unlimited()),
        )
    }

    /// Run one mailbox operation under the limiter and retry policy.
    pub fn call<T>(
        &self,
        operation: &str,
        on_retry: RetryHook<'_>,
        mut op: impl FnMut(&dyn MailboxClient) -> Result<T>,
    ) -> Result<T> {
        self.retry.run(operation, on_retry, || {
            self.limiter.acquire();
            op(self.client.as_ref())
        })
    }

    pub fn search(&self, criteria: &SearchCriteria) -> Result<SearchResults<'_>> {
        self.retry.run("search", |_, _| Ok(()), || {
            self.limiter.acquire();
            self.client.search(criteria)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::memory::{MemoryMailbox, OP_FETCH};

    #[test]
    fn test_gateway_absorbs_transient_failures() {
        let mb = Arc::new(MemoryMailbox::default());
        let r = mb.insert("All Mail", b"Message-ID: <g@x>\n\nhi\n", &[]);
        mb.fail_next(OP_FETCH, 2, true);
        let gw = MailboxGateway::unthrottled(mb.clone());
        let mut retries = Vec::new();
        let fetched = gw.call(
            "fetch",
            &mut |attempt, _: &StripError| {
                retries.push(attempt);
                Ok(())
            },
            |c| c.fetch(&r),
        );
        assert!(fetched.is_ok());
        assert_eq!(retries, vec![2, 3]);
        assert_eq!(mb.calls(OP_FETCH), 3);
    }

    #[test]
    fn test_gateway_surfaces_permanent_failures() {
        let mb = Arc::new(MemoryMailbox::default());
        let r = mb.insert("All Mail", b"Message-ID: <g@x>\n\nhi\n", &[]);
        mb.fail_next(OP_FETCH, 1, false);
        let gw = MailboxGateway::unthrottled(mb.clone());
        let fetched = gw.call("fetch", &mut |_, _| Ok(()), |c| c.fetch(&r));
        assert!(matches!(fetched, Err(StripError::Remote(_))));
        assert_eq!(mb.calls(OP_FETCH), 1);
    }
}
