//! Miner sessions.
//!
//! One [`Session`] per connection, each driven as its own task by the
//! [`Connector`]. A session moves from subscribe through authorize to
//! active, then serves jobs and classifies shares until the miner leaves or
//! the pool shuts down. Vardiff state, the duplicate window, and the
//! notified jobs belong to the session task alone; submissions are handled
//! strictly in arrival order.

mod connector;
mod registry;

pub use connector::Connector;
pub use registry::{SessionHandle, SessionRegistry, Totals};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bitcoin::{Network, ScriptBuf};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{EventEmitter, Fact, SessionStats};
use crate::identity::{ClaimIdentity, IdentityError};
use crate::job::{coinbase, Job, JobManager, JobSource, NegotiationRequester};
use crate::protocol::{
    CodecError, CommitJobRequest, ErrorCode, Inbound, Outbound, Protocol, RequestId, Submission,
    Transport, VersionRollingRequest,
};
use crate::tags::TagCache;
use crate::tracing::prelude::*;
use crate::types::{Difficulty, EXTRANONCE1_SIZE};
use crate::validator::{
    Assignment, DuplicateTracker, NotifiedJobs, Outcome, ShareContext, ShareInfo, ShareValidator,
};
use crate::vardiff::{DifficultyChange, SnapshotStore, VardiffController, VardiffParams};

/// Encrypted connections carry exactly one channel.
const CHANNEL_ID: u32 = 1;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub network: Network,
    pub pool_tag: String,
    pub authorize_timeout: Duration,
    /// How often an active session re-checks its difficulty while quiet
    pub idle_check: Duration,
}

/// Services shared by every session.
pub struct PoolContext {
    pub settings: SessionSettings,
    pub jobs: Arc<JobManager>,
    pub validator: ShareValidator,
    pub vardiff: VardiffParams,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub tags: Arc<TagCache>,
    pub events: EventEmitter,
    pub registry: Arc<SessionRegistry>,
}

enum Flow {
    Continue,
    Close,
}

/// State that exists once a claim identity is authorized.
struct Miner {
    identity: ClaimIdentity,
    name: String,
    claim_script: ScriptBuf,
    tag: Vec<u8>,
    vardiff: VardiffController,
}

pub struct Session {
    ctx: Arc<PoolContext>,
    handle: SessionHandle,
    protocol: Protocol,
    connected_at: Instant,
    subscribed: bool,
    version_mask: u32,
    suggested: Option<Difficulty>,
    miner: Option<Miner>,
    notified: NotifiedJobs,
    seen: DuplicateTracker,
    stats: SessionStats,
}

impl Session {
    pub fn new(ctx: Arc<PoolContext>, handle: SessionHandle, protocol: Protocol) -> Self {
        let window = ctx.validator.params().duplicate_window;
        Self {
            ctx,
            handle,
            protocol,
            connected_at: Instant::now(),
            subscribed: false,
            version_mask: 0,
            suggested: None,
            miner: None,
            notified: NotifiedJobs::default(),
            seen: DuplicateTracker::new(window),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    fn extranonce2_size(&self) -> usize {
        self.ctx.validator.params().extranonce2_size
    }

    /// Serve the connection until it closes, errors, or `cancel` fires.
    ///
    /// Consumes the session; its registry slot is released on return.
    pub async fn run(mut self, transport: &mut dyn Transport, cancel: CancellationToken) -> SessionStats {
        let mut job_rx = self.ctx.jobs.subscribe();
        let mut jobs_open = true;

        let deadline = tokio::time::sleep_until(self.connected_at + self.ctx.settings.authorize_timeout);
        tokio::pin!(deadline);

        let mut idle = tokio::time::interval(self.ctx.settings.idle_check.max(Duration::from_millis(100)));
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        idle.tick().await;

        let reason = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break "shutdown",

                _ = &mut deadline, if self.miner.is_none() => {
                    info!(session = self.id(), "Not authorized in time");
                    break "authorize timeout";
                }

                item = transport.read_message() => match item {
                    None => break "closed by miner",
                    Some(Ok(msg)) => self.handle_message(transport, msg).await,
                    Some(Err(e)) if e.is_fatal() => {
                        debug!(session = self.id(), error = %e, "Transport failed");
                        break "transport error";
                    }
                    Some(Err(e)) => self.answer_codec_error(transport, e).await,
                },

                changed = job_rx.changed(), if jobs_open && self.miner.is_some() => match changed {
                    Ok(()) => {
                        let current = job_rx.borrow_and_update().current.clone();
                        self.on_new_job(transport, current).await
                    }
                    Err(_) => {
                        jobs_open = false;
                        Ok(Flow::Continue)
                    }
                },

                _ = idle.tick(), if self.miner.is_some() => self.on_idle(transport).await,
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break "disconnect",
                Err(e) => {
                    debug!(session = self.id(), error = %e, "Write to miner failed");
                    break "write failed";
                }
            }
        };

        self.finish(reason)
    }

    async fn handle_message(&mut self, t: &mut dyn Transport, msg: Inbound) -> Result<Flow> {
        trace!(session = self.id(), kind = msg.kind(), "Message from miner");
        match msg {
            Inbound::Subscribe { id, user_agent } => self.on_subscribe(t, id, user_agent).await?,
            Inbound::Configure {
                id,
                version_rolling,
            } => self.on_configure(t, id, version_rolling).await?,
            Inbound::Authorize { id, username, .. } => self.on_authorize(t, id, &username).await?,
            Inbound::OpenChannel { id, username, .. } => {
                self.on_open_channel(t, id, &username).await?
            }
            Inbound::Submit { id, submission } => self.on_submit(t, id, submission).await?,
            Inbound::SuggestDifficulty { difficulty, .. } => {
                self.on_suggest_difficulty(t, difficulty).await?
            }
            Inbound::AllocateToken { id, .. } => self.on_allocate_token(t, id).await?,
            Inbound::CommitJob { id, request } => self.on_commit_job(t, id, request).await?,
            Inbound::Disconnect => return Ok(Flow::Close),
        }
        Ok(Flow::Continue)
    }

    async fn answer_codec_error(&mut self, t: &mut dyn Transport, err: CodecError) -> Result<Flow> {
        let (id, code) = match &err {
            CodecError::MalformedMessage { id, .. } => (*id, ErrorCode::Malformed),
            CodecError::UnsupportedMessageType { id, .. } => (*id, ErrorCode::Unsupported),
            _ => return Ok(Flow::Continue),
        };
        debug!(session = self.id(), error = %err, "Rejected message");
        t.write_message(Outbound::Error { id, code }).await?;
        Ok(Flow::Continue)
    }

    async fn on_subscribe(
        &mut self,
        t: &mut dyn Transport,
        id: RequestId,
        user_agent: Option<String>,
    ) -> Result<()> {
        debug!(
            session = self.id(),
            user_agent = user_agent.as_deref().unwrap_or("-"),
            "Subscribed"
        );
        self.subscribed = true;
        t.write_message(Outbound::SubscribeResult {
            id,
            subscription_id: format!("{:x}", self.id()),
            extranonce1: self.handle.extranonce1(),
            extranonce2_size: self.extranonce2_size(),
        })
        .await?;
        Ok(())
    }

    async fn on_configure(
        &mut self,
        t: &mut dyn Transport,
        id: RequestId,
        request: Option<VersionRollingRequest>,
    ) -> Result<()> {
        let pool_mask = self.ctx.validator.params().version_mask;
        let granted = request.map(|r| r.mask & pool_mask).filter(|mask| *mask != 0);
        if let (Some(request), Some(mask)) = (request, granted) {
            if mask.count_ones() < request.min_bit_count {
                debug!(
                    session = self.id(),
                    mask = format_args!("{:08x}", mask),
                    wanted_bits = request.min_bit_count,
                    "Granted fewer version bits than requested"
                );
            }
        }
        self.version_mask = granted.unwrap_or(0);
        t.write_message(Outbound::ConfigureResult {
            id,
            version_rolling_mask: granted,
        })
        .await?;
        Ok(())
    }

    async fn on_authorize(&mut self, t: &mut dyn Transport, id: RequestId, username: &str) -> Result<()> {
        if !self.subscribed {
            t.write_message(Outbound::Error {
                id,
                code: ErrorCode::NotSubscribed,
            })
            .await?;
            return Ok(());
        }
        if let Some(miner) = &self.miner {
            let authorized = miner.name == username.trim();
            t.write_message(Outbound::AuthorizeResult { id, authorized })
                .await?;
            return Ok(());
        }

        match self.authorize(username).await {
            Ok(miner) => {
                t.write_message(Outbound::AuthorizeResult {
                    id,
                    authorized: true,
                })
                .await?;
                self.activate(t, miner, true).await
            }
            Err(e) => {
                info!(session = self.id(), username, error = %e, "Authorization refused");
                t.write_message(Outbound::AuthorizeResult {
                    id,
                    authorized: false,
                })
                .await?;
                Ok(())
            }
        }
    }

    async fn on_open_channel(&mut self, t: &mut dyn Transport, id: RequestId, username: &str) -> Result<()> {
        let refusal = if !self.subscribed {
            Some(ErrorCode::NotSubscribed)
        } else if self.miner.is_some() {
            Some(ErrorCode::Unsupported)
        } else {
            None
        };
        if let Some(code) = refusal {
            t.write_message(Outbound::ChannelRejected { id, code }).await?;
            return Ok(());
        }

        match self.authorize(username).await {
            Ok(miner) => {
                self.version_mask = self.ctx.validator.params().version_mask;
                t.write_message(Outbound::ChannelOpened {
                    id,
                    channel_id: CHANNEL_ID,
                    extranonce1: self.handle.extranonce1(),
                    extranonce2_size: self.extranonce2_size(),
                    difficulty: miner.vardiff.difficulty(),
                    version_rolling_mask: self.version_mask,
                })
                .await?;
                self.activate(t, miner, false).await
            }
            Err(e) => {
                info!(session = self.id(), username, error = %e, "Channel refused");
                t.write_message(Outbound::ChannelRejected {
                    id,
                    code: ErrorCode::Unauthorized,
                })
                .await?;
                Ok(())
            }
        }
    }

    /// Resolve a username into a claim identity with its tag and starting
    /// difficulty.
    async fn authorize(&self, username: &str) -> std::result::Result<Miner, IdentityError> {
        let identity = ClaimIdentity::parse(username, self.ctx.settings.network)?;
        let name = identity.to_string();
        let user_tag = self.ctx.tags.tag_for(&identity.address_string()).await;
        let tag = coinbase::tag_bytes(&self.ctx.settings.pool_tag, user_tag.as_deref());

        let now = Instant::now();
        let mut vardiff = VardiffController::new(self.ctx.vardiff.clone(), now);
        if let Some(saved) = self.ctx.snapshots.load(&name, SystemTime::now()) {
            if let Some(change) = vardiff.restore(saved, now) {
                self.emit_difficulty(Some(&name), &change);
            }
        }
        if let Some(suggested) = self.suggested {
            if let Some(change) = vardiff.on_suggest(suggested, now) {
                self.emit_difficulty(Some(&name), &change);
            }
        }

        Ok(Miner {
            claim_script: identity.claim_script(),
            identity,
            name,
            tag,
            vardiff,
        })
    }

    async fn activate(&mut self, t: &mut dyn Transport, miner: Miner, send_difficulty: bool) -> Result<()> {
        let difficulty = miner.vardiff.difficulty();
        info!(
            session = self.id(),
            protocol = %self.protocol,
            identity = %miner.name,
            kind = ?miner.identity.kind,
            difficulty = %difficulty,
            "Miner authorized"
        );
        self.handle.set_identity(&miner.name);
        self.handle.set_difficulty(difficulty.as_f64());
        self.miner = Some(miner);

        if send_difficulty {
            t.write_message(Outbound::SetDifficulty(difficulty)).await?;
        }
        match self.ctx.jobs.current_job() {
            Some(job) => self.notify(t, job, true).await,
            None => {
                debug!(session = self.id(), "No job to send yet");
                Ok(())
            }
        }
    }

    /// Send `job` specialized for this miner and remember the assignment.
    async fn notify(&mut self, t: &mut dyn Transport, job: Arc<Job>, clean: bool) -> Result<()> {
        let Some(miner) = &self.miner else {
            return Ok(());
        };
        let extranonce_len = EXTRANONCE1_SIZE + self.extranonce2_size();
        let parts = match job.coinbase_parts(&miner.claim_script, &miner.tag, extranonce_len) {
            Ok(parts) => parts,
            Err(e) => {
                error!(session = self.id(), generation = job.generation, error = %e, "Cannot build coinbase");
                return Ok(());
            }
        };
        let difficulty = miner.vardiff.difficulty();
        let msg = job.notify(&parts, clean);

        trace!(session = self.id(), generation = job.generation, clean, "Job sent");
        let now = Instant::now();
        self.notified
            .push(Assignment::new(job, parts, difficulty, now), now);
        t.write_message(Outbound::NotifyJob(msg)).await?;
        Ok(())
    }

    /// Whether a negotiated assignment's commitment still exists.
    fn is_live(&self, assignment: &Assignment) -> bool {
        match assignment.job.source {
            JobSource::Pool => true,
            JobSource::Negotiated { token } => self.ctx.jobs.negotiated_job(token).is_some(),
        }
    }

    async fn on_new_job(&mut self, t: &mut dyn Transport, current: Option<Arc<Job>>) -> Result<Flow> {
        let Some(job) = current else {
            return Ok(Flow::Continue);
        };
        if let Some(assigned) = self.notified.current() {
            if assigned.generation() == job.generation {
                return Ok(Flow::Continue);
            }
            if !job.clean && assigned.job.source != JobSource::Pool && self.is_live(assigned) {
                trace!(session = self.id(), "Keeping negotiated job over pool refresh");
                return Ok(Flow::Continue);
            }
        }
        let clean = job.clean;
        self.notify(t, job, clean).await?;
        Ok(Flow::Continue)
    }

    async fn on_idle(&mut self, t: &mut dyn Transport) -> Result<Flow> {
        let now = Instant::now();
        let change = self.miner.as_mut().and_then(|m| m.vardiff.on_idle(now));
        if let Some(change) = change {
            self.apply_difficulty(t, change).await?;
        }
        Ok(Flow::Continue)
    }

    fn emit_difficulty(&self, identity: Option<&str>, change: &DifficultyChange) {
        self.ctx.events.emit(Fact::DifficultyChanged {
            session: self.id(),
            identity: identity.map(str::to_string),
            old: change.old.as_f64(),
            new: change.new.as_f64(),
            reason: change.reason.as_str(),
        });
    }

    /// Push a retarget to the miner and re-send the current job at the new
    /// difficulty.
    async fn apply_difficulty(&mut self, t: &mut dyn Transport, change: DifficultyChange) -> Result<()> {
        let name = self.miner.as_ref().map(|m| m.name.clone());
        debug!(
            session = self.id(),
            old = %change.old,
            new = %change.new,
            reason = change.reason.as_str(),
            "Difficulty changed"
        );
        self.emit_difficulty(name.as_deref(), &change);
        self.handle.set_difficulty(change.new.as_f64());
        t.write_message(Outbound::SetDifficulty(change.new)).await?;

        let current = self.notified.current().map(|a| a.job.clone());
        if let Some(job) = current {
            self.notify(t, job, false).await?;
        }
        Ok(())
    }

    async fn on_suggest_difficulty(&mut self, t: &mut dyn Transport, value: f64) -> Result<()> {
        let Some(difficulty) = Difficulty::new(value) else {
            debug!(session = self.id(), value, "Ignoring invalid suggested difficulty");
            return Ok(());
        };
        let now = Instant::now();
        let change = match self.miner.as_mut() {
            Some(miner) => miner.vardiff.on_suggest(difficulty, now),
            None => {
                self.suggested = Some(difficulty);
                None
            }
        };
        if let Some(change) = change {
            self.apply_difficulty(t, change).await?;
        }
        Ok(())
    }

    async fn on_submit(&mut self, t: &mut dyn Transport, id: RequestId, submission: Submission) -> Result<()> {
        let Some(miner) = &self.miner else {
            t.write_message(Outbound::SubmitResult {
                id,
                result: Err(ErrorCode::Unauthorized),
            })
            .await?;
            return Ok(());
        };
        let identity = miner.name.clone();
        let current_difficulty = miner.vardiff.difficulty();

        let now = Instant::now();
        let ctx = ShareContext {
            extranonce1: self.handle.extranonce1(),
            version_mask: self.version_mask,
            now,
        };
        let assignment = self
            .notified
            .find(submission.job_id)
            .filter(|a| self.is_live(a));
        let outcome = self
            .ctx
            .validator
            .validate(&ctx, assignment, &submission, &self.seen);

        let accepted = outcome.is_accepted();
        let share = outcome.share();
        if let Some(share) = share {
            self.seen.record(share.key.clone());
        }
        let share_difficulty = share.map(|s| s.difficulty.as_f64());
        let rolled = share.is_some_and(|s| s.version_rolling);
        self.stats.submitted += 1;
        if accepted {
            self.stats.accepted += 1;
            if let Some(d) = share_difficulty {
                self.stats.best_difficulty = self.stats.best_difficulty.max(d);
            }
            if rolled && !self.stats.version_rolling {
                debug!(session = self.id(), "Miner is rolling version bits");
                self.stats.version_rolling = true;
                self.handle.set_version_rolling();
            }
        } else {
            self.stats.rejected += 1;
        }
        self.handle.record_share(accepted, share_difficulty);

        let reason = match &outcome {
            Outcome::Malformed(why) => Some(*why),
            other => other.error_code().map(ErrorCode::as_str),
        };
        debug!(
            session = self.id(),
            job = submission.job_id,
            outcome = outcome.kind(),
            share_difficulty,
            "Share"
        );
        self.ctx.events.emit(Fact::ShareOutcome {
            session: self.id(),
            identity: identity.clone(),
            generation: share.map_or(submission.job_id, |s| s.generation),
            outcome: outcome.kind(),
            reason,
            assigned_difficulty: share.map_or(current_difficulty, |s| s.assigned).as_f64(),
            share_difficulty,
            version_rolling: rolled,
        });

        t.write_message(Outbound::SubmitResult {
            id,
            result: outcome.error_code().map_or(Ok(()), Err),
        })
        .await?;

        if let Outcome::BlockSolve(info) = &outcome {
            self.on_block_solved(info, &identity).await;
        }
        if accepted {
            let change = self
                .miner
                .as_mut()
                .and_then(|m| m.vardiff.on_share_accepted(now));
            if let Some(change) = change {
                self.apply_difficulty(t, change).await?;
            }
        }
        Ok(())
    }

    async fn on_block_solved(&self, info: &ShareInfo, identity: &str) {
        let Some(job) = self.notified.find(info.generation).map(|a| a.job.clone()) else {
            return;
        };
        self.handle.record_block();
        info!(
            session = self.id(),
            identity,
            generation = info.generation,
            height = job.height,
            hash = %info.hash,
            source = %job.source,
            "Block solved"
        );
        self.ctx.events.emit(Fact::BlockSolved {
            session: self.id(),
            identity: identity.to_string(),
            generation: info.generation,
            source: job.source,
            hash: info.hash.to_string(),
            height: job.height,
        });
        if let Err(e) = self
            .ctx
            .jobs
            .submit_block(&job, info.header, &info.coinbase)
            .await
        {
            error!(session = self.id(), hash = %info.hash, error = %e, "Block submission failed");
        }
    }

    async fn on_allocate_token(&mut self, t: &mut dyn Transport, id: RequestId) -> Result<()> {
        if self.miner.is_none() {
            t.write_message(Outbound::Error {
                id,
                code: ErrorCode::Unauthorized,
            })
            .await?;
            return Ok(());
        }
        let Ok(token) = self.ctx.jobs.allocate_token(self.id()) else {
            t.write_message(Outbound::Error {
                id,
                code: ErrorCode::TooManyTokens,
            })
            .await?;
            return Ok(());
        };
        debug!(session = self.id(), token = format_args!("{:016x}", token), "Token allocated");
        t.write_message(Outbound::TokenAllocated { id, token }).await?;
        Ok(())
    }

    async fn on_commit_job(&mut self, t: &mut dyn Transport, id: RequestId, request: CommitJobRequest) -> Result<()> {
        let Some(miner) = &self.miner else {
            t.write_message(Outbound::CommitJobResult {
                id,
                result: Err(ErrorCode::Unauthorized.as_str()),
            })
            .await?;
            return Ok(());
        };
        let requester = NegotiationRequester {
            session: self.id(),
            identity: miner.name.clone(),
            claim_script: miner.claim_script.clone(),
        };

        match self
            .ctx
            .jobs
            .accept_negotiated_template(&requester, &request, SystemTime::now())
        {
            Ok(commitment) => {
                t.write_message(Outbound::CommitJobResult {
                    id,
                    result: Ok(commitment.token),
                })
                .await?;
                self.notify(t, commitment.job.clone(), true).await
            }
            Err(reason) => {
                t.write_message(Outbound::CommitJobResult {
                    id,
                    result: Err(reason.as_str()),
                })
                .await?;
                Ok(())
            }
        }
    }

    /// Report the session's end; also used when it never got past setup.
    pub(super) fn finish(self, reason: &'static str) -> SessionStats {
        let now = Instant::now();
        let mut stats = self.stats.clone();
        stats.duration_secs = now.saturating_duration_since(self.connected_at).as_secs_f64();

        let identity = self.miner.as_ref().map(|m| m.name.clone());
        if let Some(miner) = &self.miner {
            stats.final_difficulty = miner.vardiff.difficulty().as_f64();
            if let Some(difficulty) = miner.vardiff.finish(now) {
                self.ctx
                    .snapshots
                    .save(&miner.name, difficulty, SystemTime::now());
            }
        }
        self.ctx.jobs.release_session(self.id());

        info!(
            session = self.id(),
            identity = identity.as_deref().unwrap_or("-"),
            reason,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "Session ended"
        );
        self.ctx.events.emit(Fact::SessionDisconnected {
            session: self.id(),
            identity,
            stats: stats.clone(),
        });
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    use bitcoin::Address;
    use tokio::sync::mpsc;

    use crate::events::Envelope;
    use crate::job::{regtest_template, JobParams};
    use crate::protocol::{MockTransport, MockTransportHandle, RolledVersion};
    use crate::tags::StaticTags;
    use crate::types::Extranonce1;
    use crate::upstream::mock::MockSource;
    use crate::validator::tests::claim_script;
    use crate::validator::ValidationParams;
    use crate::types::ShareRate;
    use crate::vardiff::MemoryStore;

    pub(crate) const POOL_TAG: &str = "/mujina/";

    pub(crate) struct Harness {
        pub ctx: Arc<PoolContext>,
        pub source: Arc<MockSource>,
        pub events: mpsc::Receiver<Envelope>,
    }

    impl Harness {
        pub fn drain_events(&mut self) -> Vec<Fact> {
            let mut facts = Vec::new();
            while let Ok(envelope) = self.events.try_recv() {
                facts.push(envelope.fact);
            }
            facts
        }
    }

    /// Vardiff pinned at a tiny difficulty so tests see no retargets.
    pub(crate) fn fixed_vardiff() -> VardiffParams {
        let d = Difficulty::new(1e-12).unwrap();
        VardiffParams {
            min: d,
            max: d,
            start: d,
            ..VardiffParams::default()
        }
    }

    pub(crate) fn harness_with(bits: &str, vardiff: VardiffParams, authorize_timeout: Duration) -> Harness {
        let (events, rx) = EventEmitter::new(1024, "test", "pool-a");
        let source = Arc::new(MockSource::default());
        let jobs = Arc::new(JobManager::new(
            JobParams::default(),
            events.clone(),
            source.clone(),
        ));
        let mut template = regtest_template();
        template.bits = bits.into();
        jobs.install_template(&template).unwrap();

        let tags = TagCache::new(
            Arc::new(StaticTags::new(HashMap::new())),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .unwrap();
        let ctx = Arc::new(PoolContext {
            settings: SessionSettings {
                network: Network::Regtest,
                pool_tag: POOL_TAG.into(),
                authorize_timeout,
                idle_check: Duration::from_secs(60),
            },
            jobs,
            validator: ShareValidator::new(ValidationParams::default()),
            vardiff,
            snapshots: Arc::new(MemoryStore::new(Duration::from_secs(3600))),
            tags: Arc::new(tags),
            events,
            registry: Arc::new(SessionRegistry::new(16)),
        });
        Harness {
            ctx,
            source,
            events: rx,
        }
    }

    pub(crate) fn harness(bits: &str) -> Harness {
        harness_with(bits, fixed_vardiff(), Duration::from_secs(600))
    }

    pub(crate) fn regtest_address() -> String {
        Address::from_script(&claim_script(), Network::Regtest)
            .unwrap()
            .to_string()
    }

    fn start(h: &Harness) -> (tokio::task::JoinHandle<SessionStats>, MockTransportHandle, CancellationToken) {
        let handle = h
            .ctx
            .registry
            .register(Protocol::Plaintext, "127.0.0.1:4000".into())
            .unwrap();
        let session = Session::new(h.ctx.clone(), handle, Protocol::Plaintext);
        let (mut transport, miner) = MockTransport::pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { session.run(&mut transport, cancel).await }
        });
        (task, miner, cancel)
    }

    /// Subscribe and authorize; returns the extranonce1 and first job.
    async fn login(miner: &mut MockTransportHandle, username: &str) -> (Extranonce1, crate::protocol::JobNotify) {
        miner.send(Inbound::Subscribe {
            id: Some(1),
            user_agent: Some("test/1.0".into()),
        });
        let Outbound::SubscribeResult { extranonce1, .. } = miner.recv().await else {
            panic!("expected subscribe result");
        };
        miner.send(Inbound::Authorize {
            id: Some(2),
            username: username.into(),
            password: None,
        });
        assert_eq!(
            miner.recv().await,
            Outbound::AuthorizeResult {
                id: Some(2),
                authorized: true
            }
        );
        assert!(matches!(miner.recv().await, Outbound::SetDifficulty(_)));
        let Outbound::NotifyJob(job) = miner.recv().await else {
            panic!("expected job");
        };
        (extranonce1, job)
    }

    /// Find a nonce whose share classifies as `kind` for this session.
    pub(crate) fn solve(job: &Arc<Job>, extranonce1: Extranonce1, kind: &str) -> u32 {
        solve_with(job, extranonce1, kind, None, 0, 0)
    }

    /// [`solve`] for a rolled version, searching from nonce `from`.
    pub(crate) fn solve_with(
        job: &Arc<Job>,
        extranonce1: Extranonce1,
        kind: &str,
        version: Option<RolledVersion>,
        version_mask: u32,
        from: u32,
    ) -> u32 {
        let tag = coinbase::tag_bytes(POOL_TAG, None);
        let parts = job
            .coinbase_parts(&claim_script(), &tag, EXTRANONCE1_SIZE + 8)
            .unwrap();
        let now = Instant::now();
        let assignment = Assignment::new(
            job.clone(),
            parts,
            Difficulty::new(1e-12).unwrap(),
            now,
        );
        let validator = ShareValidator::new(ValidationParams::default());
        let seen = DuplicateTracker::new(4);
        let ctx = ShareContext {
            extranonce1,
            version_mask,
            now,
        };
        (from..from + 10_000)
            .find(|nonce| {
                let submission = Submission {
                    job_id: job.generation,
                    extranonce2: vec![0; 8],
                    ntime: job.time,
                    nonce: *nonce,
                    version,
                };
                validator
                    .validate(&ctx, Some(&assignment), &submission, &seen)
                    .kind()
                    == kind
            })
            .unwrap()
    }

    fn submit(job_id: u64, nonce: u32, id: u64) -> Inbound {
        Inbound::Submit {
            id: Some(id),
            submission: Submission {
                job_id,
                extranonce2: vec![0; 8],
                ntime: 1_700_000_000,
                nonce,
                version: None,
            },
        }
    }

    #[tokio::test]
    async fn test_plaintext_block_solve_and_duplicate() {
        let mut h = harness("207fffff");
        let (task, mut miner, _cancel) = start(&h);
        let username = format!("{}.rig1", regtest_address());
        let (extranonce1, notify) = login(&mut miner, &username).await;
        assert!(notify.clean);
        assert_eq!(notify.job_id, 1);

        let job = h.ctx.jobs.lookup(1).unwrap();
        let nonce = solve(&job, extranonce1, "block_solve");
        miner.send(submit(1, nonce, 10));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(10),
                result: Ok(())
            }
        );
        miner.send(submit(1, nonce, 11));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(11),
                result: Err(ErrorCode::Duplicate)
            }
        );
        miner.send(Inbound::Disconnect);
        let stats = task.await.unwrap();
        assert_eq!((stats.submitted, stats.accepted, stats.rejected), (2, 1, 1));
        assert_eq!(h.source.submitted.lock().len(), 1);

        let facts = h.drain_events();
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::BlockSolved { generation: 1, source: JobSource::Pool, .. }
        )));
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::ShareOutcome { outcome: "duplicate", reason: Some("duplicate"), .. }
        )));
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::SessionDisconnected { identity: Some(name), .. } if *name == username
        )));
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_share_below_network_target_is_accepted() {
        let h = harness("1d00ffff");
        let (task, mut miner, cancel) = start(&h);
        let (extranonce1, _) = login(&mut miner, &regtest_address()).await;

        let job = h.ctx.jobs.lookup(1).unwrap();
        let nonce = solve(&job, extranonce1, "accept");
        miner.send(submit(1, nonce, 7));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(7),
                result: Ok(())
            }
        );
        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert!(h.source.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bad_address_is_refused() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Subscribe {
            id: Some(1),
            user_agent: None,
        });
        miner.recv().await;
        miner.send(Inbound::Authorize {
            id: Some(2),
            username: "not-an-address".into(),
            password: None,
        });
        assert_eq!(
            miner.recv().await,
            Outbound::AuthorizeResult {
                id: Some(2),
                authorized: false
            }
        );
        miner.send(submit(1, 0, 3));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(3),
                result: Err(ErrorCode::Unauthorized)
            }
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_requires_subscribe() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Authorize {
            id: Some(1),
            username: regtest_address(),
            password: None,
        });
        assert_eq!(
            miner.recv().await,
            Outbound::Error {
                id: Some(1),
                code: ErrorCode::NotSubscribed
            }
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorize_timeout_ends_session() {
        let mut h = harness_with("207fffff", fixed_vardiff(), Duration::from_secs(5));
        let (task, _miner, _cancel) = start(&h);
        let stats = task.await.unwrap();
        assert_eq!(stats.submitted, 0);
        assert!(h
            .drain_events()
            .iter()
            .any(|f| matches!(f, Fact::SessionDisconnected { identity: None, .. })));
    }

    #[tokio::test]
    async fn test_malformed_message_is_answered() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send_error(CodecError::malformed(Some(4), "bad params"));
        assert_eq!(
            miner.recv().await,
            Outbound::Error {
                id: Some(4),
                code: ErrorCode::Malformed
            }
        );
        miner.send(Inbound::Subscribe {
            id: Some(5),
            user_agent: None,
        });
        assert!(matches!(miner.recv().await, Outbound::SubscribeResult { .. }));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_grants_pool_mask_subset() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Configure {
            id: Some(1),
            version_rolling: Some(VersionRollingRequest {
                mask: 0xffff_ffff,
                min_bit_count: 2,
            }),
        });
        assert_eq!(
            miner.recv().await,
            Outbound::ConfigureResult {
                id: Some(1),
                version_rolling_mask: Some(0x1fff_e000)
            }
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_tip_notifies_and_old_job_goes_stale() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        let (extranonce1, _) = login(&mut miner, &regtest_address()).await;
        let old = h.ctx.jobs.lookup(1).unwrap();
        let nonce = solve(&old, extranonce1, "accept");

        let mut next = regtest_template();
        next.previous_block_hash =
            "0000000000000000000000000000000000000000000000000000000000000001".into();
        next.height = 2;
        h.ctx.jobs.install_template(&next).unwrap();
        let Outbound::NotifyJob(notify) = miner.recv().await else {
            panic!("expected job");
        };
        assert_eq!(notify.job_id, 2);
        assert!(notify.clean);

        tokio::time::advance(Duration::from_secs(6)).await;
        miner.send(submit(1, nonce, 9));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(9),
                result: Err(ErrorCode::JobNotFound)
            }
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_suggest_difficulty_resends_job() {
        let vardiff = VardiffParams {
            min: Difficulty::new(1e-12).unwrap(),
            start: Difficulty::new(1e-12).unwrap(),
            ..VardiffParams::default()
        };
        let mut h = harness_with("207fffff", vardiff, Duration::from_secs(600));
        let (task, mut miner, cancel) = start(&h);
        let (_, first) = login(&mut miner, &regtest_address()).await;

        miner.send(Inbound::SuggestDifficulty {
            id: None,
            difficulty: 64.0,
        });
        assert_eq!(miner.recv().await, Outbound::SetDifficulty(Difficulty::from(64)));
        let Outbound::NotifyJob(again) = miner.recv().await else {
            panic!("expected job");
        };
        assert_eq!(again.job_id, first.job_id);
        assert!(!again.clean);

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.final_difficulty, 64.0);
        assert!(h.drain_events().iter().any(|f| matches!(
            f,
            Fact::DifficultyChanged { reason: "manual", new, .. } if *new == 64.0
        )));
    }

    #[tokio::test]
    async fn test_negotiated_job_flow() {
        let mut h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Subscribe {
            id: Some(1),
            user_agent: None,
        });
        miner.recv().await;
        miner.send(Inbound::OpenChannel {
            id: Some(2),
            username: regtest_address(),
            nominal_hashrate: 1e12,
        });
        let Outbound::ChannelOpened {
            version_rolling_mask,
            ..
        } = miner.recv().await
        else {
            panic!("expected channel");
        };
        assert_eq!(version_rolling_mask, 0x1fff_e000);
        assert!(matches!(miner.recv().await, Outbound::NotifyJob(_)));

        miner.send(Inbound::AllocateToken {
            id: Some(3),
            user_identifier: "rig".into(),
        });
        let Outbound::TokenAllocated { token, .. } = miner.recv().await else {
            panic!("expected token");
        };

        let tip = h.ctx.jobs.current_job().unwrap();
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        miner.send(Inbound::CommitJob {
            id: Some(4),
            request: CommitJobRequest {
                token,
                version: tip.version,
                prev_hash: tip.prev_blockhash,
                bits: tip.bits.to_consensus(),
                time: now,
                coinbase_value: tip.coinbase_value,
                fee_total: 0,
                coinbase_outputs: vec![],
                transactions: vec![],
            },
        });
        assert_eq!(
            miner.recv().await,
            Outbound::CommitJobResult {
                id: Some(4),
                result: Ok(token)
            }
        );
        let Outbound::NotifyJob(negotiated) = miner.recv().await else {
            panic!("expected negotiated job");
        };
        assert_ne!(negotiated.job_id, tip.generation);
        assert_eq!(negotiated.time, now);

        // A spent token is not accepted twice.
        miner.send(Inbound::CommitJob {
            id: Some(5),
            request: CommitJobRequest {
                token,
                version: tip.version,
                prev_hash: tip.prev_blockhash,
                bits: tip.bits.to_consensus(),
                time: now,
                coinbase_value: tip.coinbase_value,
                fee_total: 0,
                coinbase_outputs: vec![],
                transactions: vec![],
            },
        });
        assert_eq!(
            miner.recv().await,
            Outbound::CommitJobResult {
                id: Some(5),
                result: Err("unknown_token")
            }
        );

        // The tip moves on; a template on the old tip is stale.
        let mut next = regtest_template();
        next.previous_block_hash =
            "0000000000000000000000000000000000000000000000000000000000000001".into();
        next.height = 2;
        h.ctx.jobs.install_template(&next).unwrap();
        let Outbound::NotifyJob(moved) = miner.recv().await else {
            panic!("expected job on new tip");
        };
        assert!(moved.clean);
        assert!(h.ctx.jobs.negotiated_job(token).is_none());

        miner.send(Inbound::AllocateToken {
            id: Some(6),
            user_identifier: "rig".into(),
        });
        let Outbound::TokenAllocated { token: fresh, .. } = miner.recv().await else {
            panic!("expected token");
        };
        miner.send(Inbound::CommitJob {
            id: Some(7),
            request: CommitJobRequest {
                token: fresh,
                version: tip.version,
                prev_hash: tip.prev_blockhash,
                bits: tip.bits.to_consensus(),
                time: now,
                coinbase_value: tip.coinbase_value,
                fee_total: 0,
                coinbase_outputs: vec![],
                transactions: vec![],
            },
        });
        assert_eq!(
            miner.recv().await,
            Outbound::CommitJobResult {
                id: Some(7),
                result: Err("stale_prev_hash")
            }
        );

        cancel.cancel();
        task.await.unwrap();
        assert!(h.drain_events().iter().any(|f| matches!(
            f,
            Fact::TemplateNegotiated { accepted: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_token_allocation_is_capped() {
        let h = harness("207fffff");
        let (task, mut miner, cancel) = start(&h);
        login(&mut miner, &regtest_address()).await;

        let limit = JobParams::default().max_tokens_per_session as u64;
        for id in 0..limit {
            miner.send(Inbound::AllocateToken {
                id: Some(id),
                user_identifier: "rig".into(),
            });
            assert!(matches!(miner.recv().await, Outbound::TokenAllocated { .. }));
        }
        miner.send(Inbound::AllocateToken {
            id: Some(limit),
            user_identifier: "rig".into(),
        });
        assert_eq!(
            miner.recv().await,
            Outbound::Error {
                id: Some(limit),
                code: ErrorCode::TooManyTokens
            }
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rolled_share_marks_version_rolling() {
        let mut h = harness("1d00ffff");
        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Configure {
            id: Some(9),
            version_rolling: Some(VersionRollingRequest {
                mask: 0x1fff_e000,
                min_bit_count: 2,
            }),
        });
        assert!(matches!(
            miner.recv().await,
            Outbound::ConfigureResult { version_rolling_mask: Some(0x1fff_e000), .. }
        ));
        let (extranonce1, _) = login(&mut miner, &regtest_address()).await;
        let job = h.ctx.jobs.lookup(1).unwrap();

        let plain = solve(&job, extranonce1, "accept");
        miner.send(submit(1, plain, 10));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(10),
                result: Ok(())
            }
        );
        assert!(!h.ctx.registry.sessions()[0].version_rolling);

        let rolled = Some(RolledVersion::Bits(0x0000_e000));
        let nonce = solve_with(&job, extranonce1, "accept", rolled, 0x1fff_e000, 0);
        miner.send(Inbound::Submit {
            id: Some(11),
            submission: Submission {
                job_id: 1,
                extranonce2: vec![0; 8],
                ntime: job.time,
                nonce,
                version: rolled,
            },
        });
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(11),
                result: Ok(())
            }
        );
        assert!(h.ctx.registry.sessions()[0].version_rolling);

        cancel.cancel();
        let stats = task.await.unwrap();
        assert!(stats.version_rolling);
        let rolled_flags: Vec<bool> = h
            .drain_events()
            .iter()
            .filter_map(|f| match f {
                Fact::ShareOutcome { version_rolling, .. } => Some(*version_rolling),
                _ => None,
            })
            .collect();
        assert_eq!(rolled_flags, vec![false, true]);
    }

    /// Shares every ten seconds after a fast first one: ramps once, then
    /// settles.
    fn restoring_vardiff() -> VardiffParams {
        VardiffParams {
            target_interval: ShareRate::from_interval(Duration::from_secs(10)).unwrap(),
            min: Difficulty::new(1e-12).unwrap(),
            max: Difficulty::new(1e-10).unwrap(),
            start: Difficulty::new(1e-12).unwrap(),
            min_stable: Duration::from_secs(20),
            ..VardiffParams::default()
        }
    }

    async fn accept(miner: &mut MockTransportHandle, nonce: u32, id: u64) {
        miner.send(submit(1, nonce, id));
        assert_eq!(
            miner.recv().await,
            Outbound::SubmitResult {
                id: Some(id),
                result: Ok(())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_stable_difficulty() {
        let mut h = harness_with("1d00ffff", restoring_vardiff(), Duration::from_secs(600));
        let username = format!("{}.rig1", regtest_address());

        let (task, mut miner, _cancel) = start(&h);
        let (extranonce1, _) = login(&mut miner, &username).await;
        let job = h.ctx.jobs.lookup(1).unwrap();
        let nonce = |from| solve_with(&job, extranonce1, "accept", None, 0, from);

        tokio::time::advance(Duration::from_millis(500)).await;
        accept(&mut miner, nonce(0), 1).await;
        let Outbound::SetDifficulty(ramped) = miner.recv().await else {
            panic!("expected fast ramp");
        };
        assert!(ramped > Difficulty::new(1e-12).unwrap());
        assert!(matches!(miner.recv().await, Outbound::NotifyJob(_)));

        for (i, from) in [100, 200, 300].into_iter().enumerate() {
            tokio::time::advance(Duration::from_secs(10)).await;
            accept(&mut miner, nonce(from), 2 + i as u64).await;
        }
        tokio::time::advance(Duration::from_secs(25)).await;
        miner.send(Inbound::Disconnect);
        let stats = task.await.unwrap();
        assert_eq!(stats.final_difficulty, ramped.as_f64());
        h.drain_events();

        let (task, mut miner, cancel) = start(&h);
        miner.send(Inbound::Subscribe {
            id: Some(1),
            user_agent: None,
        });
        assert!(matches!(miner.recv().await, Outbound::SubscribeResult { .. }));
        miner.send(Inbound::Authorize {
            id: Some(2),
            username: username.clone(),
            password: None,
        });
        assert!(matches!(
            miner.recv().await,
            Outbound::AuthorizeResult { authorized: true, .. }
        ));
        assert_eq!(miner.recv().await, Outbound::SetDifficulty(ramped));

        cancel.cancel();
        task.await.unwrap();
        assert!(h.drain_events().iter().any(|f| matches!(
            f,
            Fact::DifficultyChanged { reason: "reconnect_restore", new, identity: Some(name), .. }
                if *new == ramped.as_f64() && *name == username
        )));
    }
}
