use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::apiv1::conn_pool::ConnectionManager;
use crate::apiv1::spanner_client::{ping_query_request, Client};
use crate::apiv1::types::transaction_options::{Mode, ReadWrite};
use crate::apiv1::types::{
    BatchCreateSessionsRequest, BeginTransactionRequest, CreateSessionRequest, DeleteSessionRequest, Session,
    TransactionOptions,
};
use crate::retry::{is_session_not_found, TryAs};

/// Multiplexed sessions expire on the server after 28 days. They are replaced well before that.
const MULTIPLEXED_SESSION_REFRESH: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Session
pub struct SessionHandle {
    pub session: Session,
    pub spanner_client: Client,
    valid: AtomicBool,
    deleted: AtomicBool,
    /// Read-write transaction begun ahead of time by the transaction pinging pool.
    prepared_transaction: Mutex<Option<Vec<u8>>>,
    last_used_at: Instant,
    last_checked_at: Instant,
    last_pong_at: Instant,
    created_at: Instant,
}

impl SessionHandle {
    pub(crate) fn new(session: Session, spanner_client: Client, now: Instant) -> SessionHandle {
        SessionHandle {
            session,
            spanner_client,
            valid: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            prepared_transaction: Mutex::new(None),
            last_used_at: now,
            last_checked_at: now,
            last_pong_at: now,
            created_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn is_multiplexed(&self) -> bool {
        self.session.multiplexed
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the session as gone when the server reports it does not exist anymore.
    pub async fn invalidate_if_needed<T>(&self, arg: Result<T, Status>) -> Result<T, Status> {
        match arg {
            Ok(s) => Ok(s),
            Err(e) => {
                self.observe_error(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn observe_error(&self, status: &Status) {
        if is_session_not_found(status) {
            tracing::debug!("session invalidate {}", self.session.name);
            self.valid.store(false, Ordering::Release);
            // nothing left to delete on the server
            self.deleted.store(true, Ordering::Release);
        }
    }

    /// The session is not reused after it is returned. It is deleted by the pool.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn take_prepared_transaction(&self) -> Option<Vec<u8>> {
        self.prepared_transaction.lock().take()
    }

    async fn delete(&self) {
        self.valid.store(false, Ordering::Release);
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        let session_name = &self.session.name;
        let request = DeleteSessionRequest {
            name: session_name.to_string(),
        };
        match self.spanner_client.delete_session(request, None).await {
            Ok(_) => self.deleted.store(true, Ordering::Release),
            Err(e) => {
                if e.code() == Code::NotFound {
                    self.deleted.store(true, Ordering::Release);
                } else {
                    tracing::error!("failed to delete session {}, {:?}", session_name, e)
                }
            }
        };
    }

    async fn prepare_transaction(&self) -> Result<(), Status> {
        let request = BeginTransactionRequest {
            session: self.session.name.to_string(),
            options: Some(TransactionOptions {
                mode: Some(Mode::ReadWrite(ReadWrite::default())),
                ..Default::default()
            }),
            request_options: None,
            mutation_key: None,
        };
        let result = self.spanner_client.begin_transaction(request, true, None).await;
        let tx = self.invalidate_if_needed(result).await?.into_inner();
        *self.prepared_transaction.lock() = Some(tx.id);
        Ok(())
    }
}

enum Lease {
    Pooled {
        session_pool: SessionPool,
        session: Option<SessionHandle>,
    },
    Multiplexed(Arc<SessionHandle>),
}

/// ManagedSession is a session lent to one transaction. Pooled sessions go back to the pool
/// when this is dropped.
pub struct ManagedSession {
    lease: Lease,
}

impl ManagedSession {
    fn new(session_pool: SessionPool, session: SessionHandle) -> Self {
        ManagedSession {
            lease: Lease::Pooled {
                session_pool,
                session: Some(session),
            },
        }
    }

    fn multiplexed(session: Arc<SessionHandle>) -> Self {
        ManagedSession {
            lease: Lease::Multiplexed(session),
        }
    }

    /// Returns the session without reusing it. A replacement is created when the pool falls
    /// below its minimum size.
    pub fn discard(self) {
        self.invalidate();
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if let Lease::Pooled { session_pool, session } = &mut self.lease {
            if let Some(session) = session.take() {
                // a prepared transaction is only handed to the next checkout that begins it
                *session.prepared_transaction.lock() = None;
                session_pool.recycle(session);
            }
        }
    }
}

impl Deref for ManagedSession {
    type Target = SessionHandle;

    fn deref(&self) -> &Self::Target {
        match &self.lease {
            Lease::Pooled { session, .. } => session.as_ref().unwrap(),
            Lease::Multiplexed(session) => session,
        }
    }
}

/// Commands for the session maintenance task.
#[derive(Debug)]
enum PoolCommand {
    Replenish(usize),
    RemoveOrphans,
}

/// Sessions have all sessions and waiters.
/// This is for atomically locking the waiting list and free sessions.
struct Sessions {
    available_sessions: VecDeque<SessionHandle>,

    waiters: VecDeque<oneshot::Sender<()>>,

    /// Invalid sessions living in the server.
    orphans: Vec<SessionHandle>,

    /// number of sessions user uses.
    num_inuse: usize,

    /// number of sessions scheduled to be replenished.
    num_creating: usize,

    num_created: u64,

    num_discarded: u64,

    /// the last attempt to create sessions failed.
    degraded: bool,

    /// Sessions returned after close are deleted instead of reused.
    closed: bool,
}

impl Sessions {
    fn new(available_sessions: VecDeque<SessionHandle>) -> Self {
        Sessions {
            num_created: available_sessions.len() as u64,
            available_sessions,
            waiters: VecDeque::new(),
            orphans: Vec::new(),
            num_inuse: 0,
            num_creating: 0,
            num_discarded: 0,
            degraded: false,
            closed: false,
        }
    }

    fn num_opened(&self) -> usize {
        self.num_inuse + self.available_sessions.len()
    }

    fn take_waiter(&mut self) -> Option<oneshot::Sender<()>> {
        while let Some(waiter) = self.waiters.pop_front() {
            // Waiter can be closed when session acquisition times out.
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn take(&mut self) -> Option<SessionHandle> {
        match self.available_sessions.pop_front() {
            None => None,
            Some(s) => {
                self.num_inuse += 1;
                Some(s)
            }
        }
    }

    /// Returns true when the session became an orphan that must be deleted on the server.
    fn release(&mut self, session: SessionHandle) -> bool {
        self.num_inuse -= 1;
        if session.is_valid() {
            self.available_sessions.push_back(session);
            return false;
        }
        self.num_discarded += 1;
        if !session.deleted.load(Ordering::Acquire) {
            tracing::trace!("save as orphan name={}", session.session.name);
            self.orphans.push(session);
            return true;
        }
        false
    }

    /// reserve calculates next session count to create.
    /// Must call replenish after calling this method.
    fn reserve(&mut self, max_opened: usize, inc_step: usize) -> usize {
        let num_opened = self.num_opened();
        let num_creating = self.num_creating;
        if max_opened <= num_creating + num_opened {
            tracing::trace!(
                "No available connections max={}, num_creating={}, current={}",
                max_opened,
                num_creating,
                num_opened
            );
            return 0;
        }
        let mut increasing = max_opened - (num_creating + num_opened);
        if increasing > inc_step {
            increasing = inc_step
        }
        self.num_creating += increasing;
        increasing
    }

    fn replenish(&mut self, session_count: usize, result: Result<Vec<SessionHandle>, Status>) {
        self.num_creating -= session_count;
        match result {
            Ok(mut new_sessions) => {
                self.degraded = false;
                self.num_created += new_sessions.len() as u64;
                while let Some(session) = new_sessions.pop() {
                    self.available_sessions.push_back(session);
                    if let Some(waiter) = self.take_waiter() {
                        let _ = waiter.send(());
                    }
                }
            }
            Err(e) => {
                self.degraded = true;
                tracing::error!("failed to create new sessions {:?}", e)
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            num_opened: self.num_opened(),
            num_inuse: self.num_inuse,
            num_idle: self.available_sessions.len(),
            num_creating: self.num_creating,
            num_waiters: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            num_orphans: self.orphans.len(),
            num_created: self.num_created,
            num_discarded: self.num_discarded,
            degraded: self.degraded,
        }
    }
}

/// Point in time view of the session pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_opened: usize,
    pub num_inuse: usize,
    pub num_idle: usize,
    pub num_creating: usize,
    pub num_waiters: usize,
    pub num_orphans: usize,
    /// sessions created since the pool started.
    pub num_created: u64,
    /// sessions dropped because they were invalid, expired or in excess.
    pub num_discarded: u64,
    pub degraded: bool,
}

#[derive(Clone)]
struct SessionPool {
    inner: Arc<RwLock<Sessions>>,
    command_sender: UnboundedSender<PoolCommand>,
    policy: Arc<PoolPolicy>,
}

impl SessionPool {
    async fn new(
        database: String,
        conn_pool: &ConnectionManager,
        command_sender: UnboundedSender<PoolCommand>,
        policy: Arc<PoolPolicy>,
    ) -> Result<Self, Status> {
        let available_sessions = Self::init_pool(database, conn_pool, &policy).await?;
        Ok(SessionPool {
            inner: Arc::new(RwLock::new(Sessions::new(available_sessions))),
            command_sender,
            policy,
        })
    }

    async fn init_pool(
        database: String,
        conn_pool: &ConnectionManager,
        policy: &PoolPolicy,
    ) -> Result<VecDeque<SessionHandle>, Status> {
        let channel_num = conn_pool.num();
        let creation_count_per_channel = policy.min_opened / channel_num;
        let remainder = policy.min_opened % channel_num;

        let mut sessions = Vec::<SessionHandle>::new();
        let mut tasks = JoinSet::new();
        for i in 0..channel_num {
            // Ensure that we create the exact number of requested sessions by adding the remainder to the first channel.
            let creation_count = if i == 0 {
                creation_count_per_channel + remainder
            } else {
                creation_count_per_channel
            };
            if creation_count == 0 {
                continue;
            }
            let next_client = conn_pool.conn();
            let database = database.clone();
            let template = policy.session_template.clone();
            tasks.spawn(async move { batch_create_sessions(next_client, &database, template, creation_count).await });
        }
        while let Some(r) = tasks.join_next().await {
            let new_sessions = r.map_err(|e| Status::internal(e.to_string()))??;
            sessions.extend(new_sessions);
        }
        tracing::debug!("initial session created count = {}", sessions.len());
        Ok(sessions.into())
    }

    fn num_opened(&self) -> usize {
        self.inner.read().num_opened()
    }

    fn send(&self, command: PoolCommand) {
        if self.command_sender.send(command).is_err() {
            tracing::trace!("session maintenance task is already closed");
        }
    }

    /// The client first checks the waiting list.
    /// If the waiting list is empty, it retrieves the first available session.
    /// If there are no available sessions, it enters the waiting list.
    /// If the waiting list is not empty, the client enters the waiting list.
    /// The client on the waiting list will be notified when another client's session has finished and
    /// when the process of replenishing the available sessions is complete.
    async fn acquire(&self) -> Result<ManagedSession, SessionError> {
        let deadline = tokio::time::Instant::now() + self.policy.session_get_timeout;
        loop {
            let (on_session_acquired, session_count) = {
                let mut sessions = self.inner.write();

                // Prioritize waiters over new acquirers.
                if sessions.waiters.is_empty() {
                    if let Some(mut s) = sessions.take() {
                        s.last_used_at = Instant::now();
                        return Ok(ManagedSession::new(self.clone(), s));
                    }
                }
                // Add the participant to the waiting list.
                let (sender, receiver) = oneshot::channel();
                sessions.waiters.push_back(sender);
                let session_count = sessions.reserve(self.policy.max_opened, self.policy.inc_step);
                (receiver, session_count)
            };

            if session_count > 0 {
                self.send(PoolCommand::Replenish(session_count));
            }

            // Wait for the session available notification.
            match tokio::time::timeout_at(deadline, on_session_acquired).await {
                Ok(Ok(())) => {
                    let mut sessions = self.inner.write();
                    if let Some(mut s) = sessions.take() {
                        s.last_used_at = Instant::now();
                        return Ok(ManagedSession::new(self.clone(), s));
                    } else {
                        continue; // another waiter raced for session
                    }
                }
                _ => {
                    {
                        let sessions = self.inner.read();
                        tracing::info!(
                            available = sessions.available_sessions.len(),
                            waiters = sessions.waiters.len(),
                            orphans = sessions.orphans.len(),
                            num_inuse = sessions.num_inuse,
                            num_creating = sessions.num_creating,
                            max_opened = self.policy.max_opened,
                            degraded = sessions.degraded,
                            "Timeout acquiring session"
                        );
                    }
                    return Err(SessionError::SessionGetTimeout);
                }
            }
        }
    }

    /// If the session is valid
    ///  - Pass the session to the first user on the waiting list.
    ///  - If there is no waiting list, the session is returned to the list of available sessions
    ///    unless it is idle beyond the pool limits.
    ///
    /// If the session is invalid or the pool is closed
    ///  - Discard the session. If the number of sessions falls below the threshold as a result of discarding, the session replenishment process is called.
    fn recycle(&self, session: SessionHandle) {
        let (waiter, session_count, orphaned, closed) = {
            let mut sessions = self.inner.write();
            let closed = sessions.closed;
            if closed {
                session.invalidate();
            }
            if session.is_valid() {
                let waiter = sessions.take_waiter();
                if waiter.is_none() {
                    if self.policy.trim_excess && sessions.available_sessions.len() >= self.policy.max_idle {
                        tracing::trace!("delete excess session name={}", session.session.name);
                        session.invalidate();
                    } else if self.policy.idle_expiry
                        && sessions.num_opened() > self.policy.max_idle
                        && session.last_used_at + self.policy.idle_timeout < Instant::now()
                    {
                        // Not reuse expired idle session
                        session.invalidate();
                    }
                }
                let orphaned = sessions.release(session);
                (waiter, 0, orphaned, closed)
            } else {
                let orphaned = sessions.release(session);
                let session_count = if closed {
                    0
                } else if !sessions.waiters.is_empty() {
                    sessions.reserve(self.policy.max_opened, self.policy.inc_step)
                } else if sessions.num_opened() < self.policy.min_opened {
                    sessions.reserve(self.policy.min_opened, self.policy.inc_step)
                } else {
                    0
                };
                (None, session_count, orphaned, closed)
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
        if session_count > 0 {
            self.send(PoolCommand::Replenish(session_count));
        }
        if orphaned {
            if closed {
                self.remove_orphans_after_close();
            } else {
                self.send(PoolCommand::RemoveOrphans);
            }
        }
    }

    /// The maintenance task is gone after close, so sessions returned late are deleted here.
    fn remove_orphans_after_close(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session_pool = self.clone();
                handle.spawn(async move { session_pool.remove_orphans().await });
            }
            Err(_) => tracing::warn!("no runtime to delete sessions returned after close"),
        }
    }

    /// Schedules creation when the pool is below its minimum size, for example after failed
    /// replenishment.
    fn fill_to_min(&self) {
        let session_count = {
            let mut sessions = self.inner.write();
            sessions.reserve(self.policy.min_opened, self.policy.inc_step)
        };
        if session_count > 0 {
            self.send(PoolCommand::Replenish(session_count));
        }
    }

    async fn close(&self) {
        let deleting_sessions = {
            let mut sessions = self.inner.write();
            sessions.closed = true;
            mem::take(&mut sessions.available_sessions)
        };
        for session in deleting_sessions {
            session.delete().await;
        }

        self.remove_orphans().await;
    }

    async fn remove_orphans(&self) {
        let empty = vec![];
        let deleting_sessions = { mem::replace(&mut self.inner.write().orphans, empty) };
        if deleting_sessions.is_empty() {
            return;
        }
        tracing::trace!("remove {} orphan sessions", deleting_sessions.len());
        for session in deleting_sessions {
            session.delete().await;
        }
    }
}

/// How the pool sizes itself and keeps sessions alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// Exactly `size` sessions created up front. Checkouts wait for a returned session.
    FixedSize { size: usize },
    /// Sessions are created on demand up to `max_opened`. Returned sessions beyond
    /// `target_size` idle ones are deleted.
    Bursty { target_size: usize },
    /// FixedSize whose idle sessions are pinged with `SELECT 1` every `ping_interval`.
    Pinging { size: usize, ping_interval: Duration },
    /// Pinging that also begins a read-write transaction on idle sessions, so the next
    /// read-write transaction on that session skips the begin round trip.
    TransactionPinging { size: usize, ping_interval: Duration },
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// max_opened is the maximum number of opened sessions allowed by the session
    /// pool. If the client tries to open a session and there are already
    /// max_opened sessions, it will block until one becomes available or the
    /// context passed to the client method is canceled or times out.
    pub max_opened: usize,

    /// min_opened is the minimum number of opened sessions that the session pool
    /// tries to maintain. Session pool won't continue to expire sessions if
    /// number of opened connections drops below min_opened. However, if a session
    /// is found to be broken, it will still be evicted from the session pool,
    /// therefore it is possible that the number of opened sessions drops below
    /// min_opened.
    pub min_opened: usize,

    /// max_idle is the maximum number of idle sessions, pool is allowed to keep.
    pub max_idle: usize,

    /// idle_timeout is the wait time before discarding an idle session.
    /// Sessions older than this value since they were last used will be discarded.
    /// However, if the number of sessions is less than or equal to min_opened, it will not be discarded.
    pub idle_timeout: Duration,

    pub session_alive_trust_duration: Duration,

    /// session_get_timeout is the maximum value of the waiting time that occurs when retrieving from the connection pool when there is no idle session.
    pub session_get_timeout: Duration,

    /// refresh_interval is the interval of cleanup and health check functions.
    pub refresh_interval: Duration,

    /// incStep is the number of sessions to create in one batch when at least
    /// one more session is needed.
    pub inc_step: usize,

    /// Overrides the sizing fields above. None keeps the dynamic pool driven by
    /// min_opened, max_opened and max_idle.
    pub pool_kind: Option<PoolKind>,

    pub labels: HashMap<String, String>,

    pub database_role: Option<String>,

    /// Read-only transactions and partitioned DML use one multiplexed session.
    pub multiplexed: bool,

    /// Read-write transactions also use the multiplexed session.
    pub multiplexed_for_read_write: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_opened: 400,
            min_opened: 10,
            max_idle: 300,
            inc_step: 25,
            idle_timeout: Duration::from_secs(30 * 60),
            session_alive_trust_duration: Duration::from_secs(55 * 60),
            session_get_timeout: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5 * 60),
            pool_kind: None,
            labels: HashMap::new(),
            database_role: None,
            multiplexed: false,
            multiplexed_for_read_write: false,
        }
    }
}

impl SessionConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let policy = PoolPolicy::from(self);
        if policy.max_opened == 0 {
            return Err("max_opened must be greater than 0".to_string());
        }
        if policy.min_opened > policy.max_opened {
            return Err(format!(
                "min_opened({}) must be less than or equal to max_opened({})",
                policy.min_opened, policy.max_opened
            ));
        }
        if policy.inc_step == 0 {
            return Err("inc_step must be greater than 0".to_string());
        }
        if self.multiplexed_for_read_write && !self.multiplexed {
            return Err("multiplexed_for_read_write requires multiplexed".to_string());
        }
        Ok(())
    }
}

/// Effective pool behavior resolved from the config.
#[derive(Clone, Debug)]
struct PoolPolicy {
    min_opened: usize,
    max_opened: usize,
    max_idle: usize,
    inc_step: usize,
    idle_timeout: Duration,
    session_get_timeout: Duration,
    refresh_interval: Duration,
    /// idle sessions older than max_idle are dropped after idle_timeout.
    idle_expiry: bool,
    /// returned sessions beyond max_idle are dropped at once.
    trim_excess: bool,
    /// sessions not used for this long are pinged.
    ping_after: Option<Duration>,
    prepare_transactions: bool,
    session_template: Option<Session>,
}

impl From<&SessionConfig> for PoolPolicy {
    fn from(config: &SessionConfig) -> Self {
        let session_template = if config.labels.is_empty() && config.database_role.is_none() {
            None
        } else {
            Some(Session {
                labels: config.labels.clone(),
                creator_role: config.database_role.clone().unwrap_or_default(),
                ..Default::default()
            })
        };
        let mut policy = PoolPolicy {
            min_opened: config.min_opened,
            max_opened: config.max_opened,
            max_idle: config.max_idle,
            inc_step: config.inc_step,
            idle_timeout: config.idle_timeout,
            session_get_timeout: config.session_get_timeout,
            refresh_interval: config.refresh_interval,
            idle_expiry: true,
            trim_excess: false,
            ping_after: Some(config.session_alive_trust_duration),
            prepare_transactions: false,
            session_template,
        };
        match &config.pool_kind {
            None => {}
            Some(PoolKind::FixedSize { size }) => {
                policy.fixed(*size);
                policy.ping_after = None;
            }
            Some(PoolKind::Bursty { target_size }) => {
                policy.min_opened = config.min_opened.min(*target_size);
                policy.max_idle = *target_size;
                policy.idle_expiry = false;
                policy.trim_excess = true;
                policy.ping_after = None;
            }
            Some(PoolKind::Pinging { size, ping_interval }) => {
                policy.fixed(*size);
                policy.ping_after = Some(*ping_interval);
                policy.refresh_interval = policy.refresh_interval.min(*ping_interval);
            }
            Some(PoolKind::TransactionPinging { size, ping_interval }) => {
                policy.fixed(*size);
                policy.ping_after = Some(*ping_interval);
                policy.refresh_interval = policy.refresh_interval.min(*ping_interval);
                policy.prepare_transactions = true;
            }
        }
        policy
    }
}

impl PoolPolicy {
    fn fixed(&mut self, size: usize) {
        self.min_opened = size;
        self.max_opened = size;
        self.max_idle = size;
        self.inc_step = self.inc_step.max(size);
        self.idle_expiry = false;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session get time out")]
    SessionGetTimeout,
    #[error("failed to create session")]
    FailedToCreateSession,
    #[error(transparent)]
    GRPC(#[from] Status),
}

impl TryAs<Status> for SessionError {
    fn try_as(&self) -> Option<&Status> {
        match self {
            SessionError::GRPC(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for Status {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::SessionGetTimeout => Status::resource_exhausted("session get time out"),
            SessionError::FailedToCreateSession => Status::unavailable("failed to create session"),
            SessionError::GRPC(status) => status,
        }
    }
}

/// The single multiplexed session of a database client.
struct MultiplexedSession {
    current: RwLock<Option<Arc<SessionHandle>>>,
    creating: tokio::sync::Mutex<()>,
}

impl MultiplexedSession {
    fn current(&self) -> Option<Arc<SessionHandle>> {
        self.current.read().as_ref().filter(|s| s.is_valid()).cloned()
    }

    async fn get_or_create(
        &self,
        database: &str,
        conn_pool: &ConnectionManager,
        policy: &PoolPolicy,
    ) -> Result<Arc<SessionHandle>, Status> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let _creating = self.creating.lock().await;
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let session = create_multiplexed_session(conn_pool.conn(), database, policy.session_template.clone()).await?;
        let session = Arc::new(session);
        *self.current.write() = Some(session.clone());
        Ok(session)
    }

    async fn refresh_if_needed(&self, database: &str, conn_pool: &ConnectionManager, policy: &PoolPolicy) {
        let expired = match self.current.read().as_ref() {
            Some(s) => !s.is_valid() || s.created_at + MULTIPLEXED_SESSION_REFRESH < Instant::now(),
            None => false,
        };
        if !expired {
            return;
        }
        let _creating = self.creating.lock().await;
        match create_multiplexed_session(conn_pool.conn(), database, policy.session_template.clone()).await {
            Ok(session) => {
                tracing::debug!("multiplexed session refreshed name={}", session.session.name);
                *self.current.write() = Some(Arc::new(session));
            }
            Err(e) => tracing::error!("failed to refresh multiplexed session {:?}", e),
        }
    }
}

pub(crate) struct SessionManager {
    database: String,
    conn_pool: Arc<ConnectionManager>,
    session_pool: SessionPool,
    multiplexed: Option<Arc<MultiplexedSession>>,
    multiplexed_for_read_write: bool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub async fn new(
        database: impl Into<String>,
        conn_pool: ConnectionManager,
        config: SessionConfig,
    ) -> Result<Arc<SessionManager>, Status> {
        let database = database.into();
        let conn_pool = Arc::new(conn_pool);
        let policy = Arc::new(PoolPolicy::from(&config));
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_pool = SessionPool::new(database.clone(), &conn_pool, sender, policy.clone()).await?;

        let multiplexed = if config.multiplexed {
            let multiplexed = Arc::new(MultiplexedSession {
                current: RwLock::new(None),
                creating: tokio::sync::Mutex::new(()),
            });
            multiplexed.get_or_create(&database, &conn_pool, &policy).await?;
            Some(multiplexed)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let task_session_cleaner = Self::spawn_health_check_task(
            policy.clone(),
            session_pool.clone(),
            database.clone(),
            conn_pool.clone(),
            multiplexed.clone(),
            cancel.clone(),
        );
        let task_session_creator = Self::spawn_session_creation_task(
            session_pool.clone(),
            policy,
            database.clone(),
            conn_pool.clone(),
            receiver,
            cancel.clone(),
        );

        let sm = SessionManager {
            database,
            conn_pool,
            session_pool,
            multiplexed,
            multiplexed_for_read_write: config.multiplexed_for_read_write,
            cancel,
            tasks: Mutex::new(vec![task_session_cleaner, task_session_creator]),
        };
        Ok(Arc::new(sm))
    }

    pub fn num_opened(&self) -> usize {
        self.session_pool.num_opened()
    }

    pub fn stats(&self) -> PoolStats {
        self.session_pool.inner.read().stats()
    }

    /// Checks out a session of the pool.
    pub async fn get(&self) -> Result<ManagedSession, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::GRPC(Status::failed_precondition("session pool is closed")));
        }
        self.session_pool.acquire().await
    }

    /// Session for read-only transactions and partitioned DML.
    pub async fn get_for_read(&self) -> Result<ManagedSession, SessionError> {
        match &self.multiplexed {
            Some(multiplexed) => self.get_multiplexed(multiplexed).await,
            None => self.get().await,
        }
    }

    /// Session for read-write transactions.
    pub async fn get_for_write(&self) -> Result<ManagedSession, SessionError> {
        match &self.multiplexed {
            Some(multiplexed) if self.multiplexed_for_read_write => self.get_multiplexed(multiplexed).await,
            _ => self.get().await,
        }
    }

    async fn get_multiplexed(&self, multiplexed: &MultiplexedSession) -> Result<ManagedSession, SessionError> {
        let policy = &self.session_pool.policy;
        let session = multiplexed.get_or_create(&self.database, &self.conn_pool, policy).await?;
        Ok(ManagedSession::multiplexed(session))
    }

    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let tasks = { mem::take(&mut *self.tasks.lock()) };
        for task in tasks {
            let _ = task.await;
        }
        self.session_pool.close().await;
    }

    fn spawn_session_creation_task(
        session_pool: SessionPool,
        policy: Arc<PoolPolicy>,
        database: String,
        conn_pool: Arc<ConnectionManager>,
        mut rx: UnboundedReceiver<PoolCommand>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::default();
            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(Ok((session_count, result))) = tasks.join_next(), if !tasks.is_empty() => {
                        session_pool.inner.write().replenish(session_count, result);
                    }
                    command = rx.recv() => match command {
                        Some(PoolCommand::Replenish(session_count)) => {
                            let client = conn_pool.conn();
                            let database = database.clone();
                            let template = policy.session_template.clone();
                            tasks.spawn(async move { (session_count, batch_create_sessions(client, &database, template, session_count).await) });
                        },
                        Some(PoolCommand::RemoveOrphans) => {
                            let session_pool = session_pool.clone();
                            tokio::spawn(async move { session_pool.remove_orphans().await });
                        },
                        None => break
                    },
                }
            }
            tracing::trace!("shutdown session creation task.");
        })
    }

    fn spawn_health_check_task(
        policy: Arc<PoolPolicy>,
        session_pool: SessionPool,
        database: String,
        conn_pool: Arc<ConnectionManager>,
        multiplexed: Option<Arc<MultiplexedSession>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let start = tokio::time::Instant::now() + policy.refresh_interval;
        let mut interval = tokio::time::interval_at(start, policy.refresh_interval);

        tokio::spawn(async move {
            loop {
                select! {
                    _ = interval.tick() => {},
                    _ = cancel.cancelled() => break
                }
                let now = Instant::now();

                // remove orphans first
                session_pool.remove_orphans().await;

                // start health check
                health_check(now + Duration::from_nanos(1), &policy, &session_pool, cancel.clone()).await;

                session_pool.fill_to_min();

                if let Some(multiplexed) = &multiplexed {
                    multiplexed.refresh_if_needed(&database, &conn_pool, &policy).await;
                }
            }
            tracing::trace!("shutdown health check task.")
        })
    }
}

/// Visits every idle session once. Sessions unused for longer than the ping threshold are
/// pinged and, when the pool prepares transactions, idle sessions get a read-write
/// transaction begun.
async fn health_check(now: Instant, policy: &PoolPolicy, sessions: &SessionPool, cancel: CancellationToken) {
    if policy.ping_after.is_none() && !policy.prepare_transactions {
        return;
    }
    tracing::trace!("start health check");
    let start = Instant::now();
    let sleep_duration = Duration::from_millis(10);
    loop {
        select! {
            _ = sleep(sleep_duration) => {},
            _ = cancel.cancelled() => break
        }
        let (mut s, needs_ping, needs_transaction) = {
            // temporary take
            let mut locked = sessions.inner.write();
            match locked.take() {
                Some(mut s) => {
                    // all the session check complete.
                    if s.last_checked_at == now {
                        locked.release(s);
                        break;
                    }
                    let needs_ping = match policy.ping_after {
                        Some(trust) => std::cmp::max(s.last_used_at, s.last_pong_at) + trust < now,
                        None => false,
                    };
                    let needs_transaction =
                        policy.prepare_transactions && s.prepared_transaction.lock().is_none();
                    if !needs_ping && !needs_transaction {
                        s.last_checked_at = now;
                        locked.release(s);
                        continue;
                    }
                    (s, needs_ping, needs_transaction)
                }
                None => break,
            }
        };

        if needs_ping {
            let request = ping_query_request(s.session.name.clone());
            let result = s.spanner_client.execute_sql(request, false, None).await;
            match s.invalidate_if_needed(result).await {
                Ok(_) => s.last_pong_at = now,
                Err(e) => {
                    tracing::debug!("ping failed name={}, {:?}", s.session.name, e);
                    s.delete().await;
                }
            }
        }
        if needs_transaction && s.is_valid() {
            if let Err(e) = s.prepare_transaction().await {
                tracing::debug!("failed to prepare transaction name={}, {:?}", s.session.name, e);
            }
        }
        s.last_checked_at = now;
        sessions.recycle(s);
    }
    tracing::trace!("end health check elapsed={}msec", start.elapsed().as_millis());
}

async fn batch_create_sessions(
    spanner_client: Client,
    database: &str,
    session_template: Option<Session>,
    mut remaining_create_count: usize,
) -> Result<Vec<SessionHandle>, Status> {
    let mut created = Vec::with_capacity(remaining_create_count);
    while remaining_create_count > 0 {
        let sessions = batch_create_session(
            spanner_client.clone(),
            database,
            session_template.clone(),
            remaining_create_count,
        )
        .await?;
        // Spanner could return less sessions than requested.
        // In that case, we should do another call using the same gRPC channel.
        let actually_created = sessions.len();
        if actually_created == 0 {
            return Err(Status::internal("no session was created"));
        }
        remaining_create_count -= actually_created.min(remaining_create_count);
        created.extend(sessions);
    }
    Ok(created)
}

async fn batch_create_session(
    spanner_client: Client,
    database: &str,
    session_template: Option<Session>,
    session_count: usize,
) -> Result<Vec<SessionHandle>, Status> {
    let request = BatchCreateSessionsRequest {
        database: database.to_string(),
        session_template,
        session_count: session_count as i32,
    };

    tracing::debug!("spawn session creation request : session_count = {}", session_count);
    let response = spanner_client.batch_create_sessions(request, None).await?.into_inner();

    let now = Instant::now();
    Ok(response
        .session
        .into_iter()
        .map(|s| SessionHandle::new(s, spanner_client.clone(), now))
        .collect::<Vec<SessionHandle>>())
}

async fn create_multiplexed_session(
    spanner_client: Client,
    database: &str,
    session_template: Option<Session>,
) -> Result<SessionHandle, Status> {
    let mut session = session_template.unwrap_or_default();
    session.multiplexed = true;
    let request = CreateSessionRequest {
        database: database.to_string(),
        session: Some(session),
    };
    let session = spanner_client.create_session(request, None).await?.into_inner();
    tracing::debug!("multiplexed session created name={}", session.name);
    Ok(SessionHandle::new(session, spanner_client, Instant::now()))
}
