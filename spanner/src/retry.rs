use std::future::Future;
use std::iter::Take;
use std::marker::PhantomData;
use std::time::Duration;

use prost::Message;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

const RETRY_INFO_KEY: &str = "google.rpc.retryinfo-bin";
const RETRY_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.RetryInfo";

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = if let Some(duration) = self.current.checked_mul(self.factor) {
            Duration::from_millis(duration)
        } else {
            Duration::from_millis(u64::MAX)
        };

        if let Some(ref max_delay) = self.max_delay {
            if duration > *max_delay {
                return Some(*max_delay);
            }
        }

        if let Some(next) = self.current.checked_mul(self.base) {
            self.current = next;
        } else {
            self.current = u64::MAX;
        }

        Some(duration)
    }
}

pub trait TryAs<T> {
    fn try_as(&self) -> Option<&T>;
}

impl TryAs<Status> for Status {
    fn try_as(&self) -> Option<&Status> {
        Some(self)
    }
}

pub trait Predicate<E> {
    fn should_retry(&mut self, error: &E) -> bool;
}

pub trait Retry<E: TryAs<Status>, T: Predicate<E>> {
    fn strategy(&self) -> Take<ExponentialBackoff>;

    fn predicate(&self) -> T;

    /// Delay before the next attempt. The backoff value is used unless the error carries a
    /// server supplied delay.
    fn delay(&self, _error: &E, backoff: Duration) -> Duration {
        backoff
    }

    /// Total time the retry loop may run, measured from the first attempt.
    fn total_timeout(&self) -> Option<Duration> {
        None
    }
}

pub struct CodePredicate {
    codes: Vec<Code>,
}

impl CodePredicate {
    pub fn new(codes: Vec<Code>) -> Self {
        Self { codes }
    }
}

impl<E> Predicate<E> for CodePredicate
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        let status = match error.try_as() {
            Some(s) => s,
            None => return false,
        };
        self.codes.contains(&status.code())
    }
}

#[derive(Clone, Debug)]
pub struct RetrySetting {
    pub from_millis: u64,
    pub max_delay: Option<Duration>,
    pub factor: u64,
    pub take: usize,
    pub codes: Vec<Code>,
}

impl Retry<Status, CodePredicate> for RetrySetting {
    fn strategy(&self) -> Take<ExponentialBackoff> {
        self.backoff()
    }

    fn predicate(&self) -> CodePredicate {
        CodePredicate::new(self.codes.clone())
    }
}

impl RetrySetting {
    fn backoff(&self) -> Take<ExponentialBackoff> {
        let mut st = ExponentialBackoff::from_millis(self.from_millis);
        st.factor = self.factor;
        st.max_delay = self.max_delay;
        st.take(self.take)
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            from_millis: 10,
            max_delay: Some(Duration::from_secs(1)),
            factor: 1u64,
            take: 5,
            codes: vec![Code::Unavailable, Code::Unknown, Code::Aborted],
        }
    }
}

/// Internal errors raised by the transport when a stream is cut. These are safe to retry even
/// though INTERNAL is otherwise fatal.
pub fn is_retryable_internal(status: &Status) -> bool {
    if status.code() != Code::Internal {
        return false;
    }
    let message = status.message();
    message.contains("stream terminated by RST_STREAM")
        || message.contains("HTTP/2 error code: INTERNAL_ERROR")
        || message.contains("Connection closed with unknown cause")
        || message.contains("Received unexpected EOS on DATA frame from server")
}

pub fn is_session_not_found(status: &Status) -> bool {
    status.code() == Code::NotFound && status.message().contains("Session not found")
}

#[derive(Clone, PartialEq, Message)]
pub struct RetryInfo {
    #[prost(message, optional, tag = "1")]
    pub retry_delay: Option<prost_types::Duration>,
}

#[derive(Clone, PartialEq, Message)]
struct StatusDetails {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// Reads the retry delay the server attached to an error, either as a trailer or as a
/// `google.rpc.RetryInfo` entry of the status details.
pub fn server_retry_delay(status: &Status) -> Option<Duration> {
    let from_trailer = status
        .metadata()
        .get_bin(RETRY_INFO_KEY)
        .and_then(|v| v.to_bytes().ok())
        .and_then(|bytes| RetryInfo::decode(bytes).ok());
    let info = match from_trailer {
        Some(info) => Some(info),
        None => StatusDetails::decode(status.details()).ok().and_then(|d| {
            d.details
                .into_iter()
                .find(|any| any.type_url == RETRY_INFO_TYPE_URL)
                .and_then(|any| RetryInfo::decode(any.value.as_slice()).ok())
        }),
    };
    info.and_then(|i| i.retry_delay)
        .and_then(|d| Duration::try_from(d).ok())
}

pub struct TransactionPredicate<E>
where
    E: TryAs<Status>,
{
    inner: CodePredicate,
    session_not_found: bool,
    _marker: PhantomData<E>,
}

impl<E> Predicate<E> for TransactionPredicate<E>
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        let status = match error.try_as() {
            Some(s) => s,
            None => return false,
        };
        let code = status.code();
        if code == Code::Internal && !is_retryable_internal(status) {
            return false;
        }
        if code == Code::NotFound {
            return self.session_not_found && is_session_not_found(status);
        }
        self.inner.should_retry(error)
    }
}

/// Retry setting of a whole transaction attempt. The server supplied retry delay takes
/// precedence over the backoff.
#[derive(Clone, Debug)]
pub struct TransactionRetrySetting {
    pub inner: RetrySetting,
    pub total_timeout: Option<Duration>,
    /// Retries on a fresh session when the server lost the session.
    pub retry_session_not_found: bool,
}

impl<E> Retry<E, TransactionPredicate<E>> for TransactionRetrySetting
where
    E: TryAs<Status>,
{
    fn strategy(&self) -> Take<ExponentialBackoff> {
        self.inner.backoff()
    }

    fn predicate(&self) -> TransactionPredicate<E> {
        TransactionPredicate {
            inner: CodePredicate::new(self.inner.codes.clone()),
            session_not_found: self.retry_session_not_found,
            _marker: PhantomData,
        }
    }

    fn delay(&self, error: &E, backoff: Duration) -> Duration {
        error.try_as().and_then(server_retry_delay).unwrap_or(backoff)
    }

    fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }
}

impl TransactionRetrySetting {
    pub fn new(codes: Vec<Code>) -> Self {
        let inner = RetrySetting {
            codes,
            take: 20,
            max_delay: Some(Duration::from_secs(32)),
            ..Default::default()
        };
        Self {
            inner,
            total_timeout: Some(Duration::from_secs(24 * 60 * 60)),
            retry_session_not_found: true,
        }
    }

    /// Setting for a stand-alone BeginTransaction.
    pub fn begin(initial: Duration) -> Self {
        let mut setting = Self::new(vec![Code::Aborted, Code::Internal]);
        setting.inner.from_millis = initial.as_millis() as u64;
        setting.inner.take = 5;
        setting.retry_session_not_found = false;
        setting
    }
}

impl Default for TransactionRetrySetting {
    fn default() -> Self {
        TransactionRetrySetting::new(vec![Code::Aborted])
    }
}

/// Retry policy for a broken result stream.
#[derive(Clone, Debug)]
pub struct StreamingRetry {
    strategy: Take<ExponentialBackoff>,
}

impl Default for StreamingRetry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRetry {
    pub fn new() -> Self {
        let mut st = ExponentialBackoff::from_millis(2);
        st.max_delay = Some(Duration::from_secs(32));
        Self { strategy: st.take(20) }
    }

    pub fn is_retryable(status: &Status) -> bool {
        status.code() == Code::Unavailable || is_retryable_internal(status)
    }

    /// Waits before the next attempt or returns the error when the stream must not be reopened.
    pub async fn next(&mut self, status: Status) -> Result<(), Status> {
        if !Self::is_retryable(&status) {
            return Err(status);
        }
        let duration = match self.strategy.next() {
            Some(d) => d,
            None => return Err(status),
        };
        let duration = server_retry_delay(&status).unwrap_or(duration);
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

fn cancelled<E: From<Status>>() -> E {
    Status::cancelled("client cancel").into()
}

pub async fn invoke<A, R, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut a: impl FnMut() -> A,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, E>>,
    C: Predicate<E>,
    RT: Retry<E, C> + Default,
{
    invoke_fn(cancel, retry, |()| {
        let f = a();
        async move { f.await.map_err(|e| (e, ())) }
    }, ())
    .await
}

/// Repeats retries when the specified error is detected.
/// The argument specified by 'v' can be reused for each retry.
pub async fn invoke_fn<R, V, A, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut f: impl FnMut(V) -> A,
    mut v: V,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, (E, V)>>,
    C: Predicate<E>,
    RT: Retry<E, C> + Default,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        let deadline = retry.total_timeout().map(|t| Instant::now() + t);
        loop {
            let result = f(v).await;
            let status = match result {
                Ok(s) => return Ok(s),
                Err(e) => {
                    v = e.1;
                    e.0
                }
            };
            if !retry.predicate().should_retry(&status) {
                return Err(status);
            }
            let duration = match strategy.next() {
                None => return Err(status),
                Some(duration) => retry.delay(&status, duration),
            };
            if let Some(deadline) = deadline {
                if Instant::now() + duration > deadline {
                    return Err(status);
                }
            }
            tracing::debug!("retry after {}ms", duration.as_millis());
            tokio::time::sleep(duration).await;
        }
    };

    match cancel {
        Some(cancel) => {
            select! {
                _ = cancel.cancelled() => Err(cancelled()),
                v = fn_loop => v
            }
        }
        None => fn_loop.await,
    }
}
