//! Current job, generations, and the upstream polling loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bitcoin::block::Header;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ScriptBuf;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::negotiation::{self, CommitmentStore, NegotiationLimits};
use super::{BlockTemplate, Job, NegotiationRequester, RejectReason, TemplateCommitment};
use crate::error::{Error, Result};
use crate::events::{EventEmitter, Fact};
use crate::protocol::CommitJobRequest;
use crate::tracing::prelude::*;
use crate::upstream::{BlockSubmission, TemplateSource};

/// Job manager settings.
#[derive(Debug, Clone)]
pub struct JobParams {
    /// Re-install an unchanged-tip template at most this often, and only if
    /// its transactions changed
    pub refresh_interval: Duration,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_time_drift: Duration,
    pub max_block_weight: u64,
    pub required_payout_script: Option<ScriptBuf>,
    /// Unspent negotiation tokens one session may hold
    pub max_tokens_per_session: usize,
    /// Negotiated templates kept per session, newest first
    pub max_commitments_per_session: usize,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_time_drift: Duration::from_secs(7200),
            max_block_weight: 4_000_000,
            required_payout_script: None,
            max_tokens_per_session: 8,
            max_commitments_per_session: 2,
        }
    }
}

/// What sessions watch: the current pool job and the one before it.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub current: Option<Arc<Job>>,
    pub previous: Option<Arc<Job>>,
}

struct Installed {
    at: Instant,
    txids: Vec<String>,
}

pub struct JobManager {
    params: JobParams,
    generation: AtomicU64,
    snapshot: watch::Sender<Arc<JobSnapshot>>,
    /// Serializes installs so generation order matches snapshot order
    install_lock: Mutex<Option<Installed>>,
    commitments: CommitmentStore,
    events: EventEmitter,
    source: Arc<dyn TemplateSource>,
}

impl JobManager {
    pub fn new(params: JobParams, events: EventEmitter, source: Arc<dyn TemplateSource>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(JobSnapshot::default()));
        let commitments = CommitmentStore::new(
            params.max_tokens_per_session,
            params.max_commitments_per_session,
        );
        Self {
            params,
            generation: AtomicU64::new(0),
            snapshot,
            install_lock: Mutex::new(None),
            commitments,
            events,
            source,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The latest pool job, if any template has been installed.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.snapshot.borrow().current.clone()
    }

    /// Receiver that wakes whenever a new pool job is installed.
    pub fn subscribe(&self) -> watch::Receiver<Arc<JobSnapshot>> {
        self.snapshot.subscribe()
    }

    /// Install an upstream template as the new pool job.
    pub fn install_template(&self, template: &BlockTemplate) -> Result<Arc<Job>> {
        let parsed = template.parse()?;
        let mut installed = self.install_lock.lock();

        let previous = self.current_job();
        let clean = previous
            .as_ref()
            .map_or(true, |p| p.prev_blockhash != parsed.prev_blockhash);

        let job = Arc::new(Job::from_template(self.next_generation(), parsed, clean));
        self.snapshot.send_replace(Arc::new(JobSnapshot {
            current: Some(job.clone()),
            previous,
        }));
        // After publishing: a commit racing this install either landed
        // first and is pruned here, or sees the new tip and is refused.
        if clean {
            let dropped = self.commitments.retain_tip(job.prev_blockhash);
            if dropped > 0 {
                debug!(dropped, "Discarded negotiated templates for old tip");
            }
        }
        *installed = Some(Installed {
            at: Instant::now(),
            txids: template.transactions.iter().map(|t| t.txid.clone()).collect(),
        });

        info!(
            generation = job.generation,
            height = job.height,
            clean,
            txs = job.transactions.len(),
            "New job"
        );
        self.events.emit(Fact::TemplateUpdated {
            generation: job.generation,
            height: job.height,
            prev_hash: job.prev_blockhash.to_string(),
            clean,
            tx_count: job.transactions.len(),
        });
        Ok(job)
    }

    /// Whether a freshly fetched template should replace the current job.
    fn wants(&self, template: &BlockTemplate) -> bool {
        let Some(current) = self.current_job() else {
            return true;
        };
        if current.prev_blockhash.to_string() != template.previous_block_hash {
            return true;
        }
        let installed = self.install_lock.lock();
        match installed.as_ref() {
            None => true,
            Some(last) => {
                last.at.elapsed() >= self.params.refresh_interval
                    && !template
                        .transactions
                        .iter()
                        .map(|t| &t.txid)
                        .eq(last.txids.iter())
            }
        }
    }

    /// Find a job by generation: current, previous, or negotiated.
    pub fn lookup(&self, generation: u64) -> Option<Arc<Job>> {
        {
            let snapshot = self.snapshot.borrow();
            for job in [&snapshot.current, &snapshot.previous].into_iter().flatten() {
                if job.generation == generation {
                    return Some(job.clone());
                }
            }
        }
        self.commitments.find_generation(generation)
    }

    /// A fresh negotiation token for `session`, within its token limit.
    pub fn allocate_token(&self, session: u64) -> std::result::Result<u64, RejectReason> {
        let result = self.commitments.allocate(session);
        if result.is_err() {
            debug!(session, limit = self.params.max_tokens_per_session, "Token limit reached");
        }
        result
    }

    /// Validate and store a miner-committed template.
    pub fn accept_negotiated_template(
        &self,
        requester: &NegotiationRequester,
        request: &CommitJobRequest,
        now: SystemTime,
    ) -> std::result::Result<Arc<TemplateCommitment>, RejectReason> {
        let limits = NegotiationLimits {
            max_time_drift: self.params.max_time_drift,
            max_block_weight: self.params.max_block_weight,
            required_payout_script: self.params.required_payout_script.clone(),
        };
        let result = self.commit_negotiated(requester, request, &limits, now);

        let (accepted, reason) = match &result {
            Ok(commitment) => {
                info!(
                    session = requester.session,
                    generation = commitment.job.generation,
                    txs = commitment.tx_count,
                    weight = commitment.weight,
                    "Negotiated template accepted"
                );
                (true, None)
            }
            Err(reason) => {
                debug!(session = requester.session, %reason, "Negotiated template rejected");
                (false, Some(reason.as_str()))
            }
        };
        self.events.emit(Fact::TemplateNegotiated {
            session: requester.session,
            token: request.token,
            accepted,
            reason,
            tx_count: request.transactions.len(),
            fee_total: request.fee_total,
        });
        result
    }

    fn commit_negotiated(
        &self,
        requester: &NegotiationRequester,
        request: &CommitJobRequest,
        limits: &NegotiationLimits,
        now: SystemTime,
    ) -> std::result::Result<Arc<TemplateCommitment>, RejectReason> {
        if !self.commitments.owns(request.token, requester.session) {
            return Err(RejectReason::UnknownToken);
        }
        let tip = self.current_job().ok_or(RejectReason::NoCurrentTemplate)?;
        let commitment =
            negotiation::validate(request, requester, &tip, limits, now, self.next_generation())?;
        self.commitments
            .insert(commitment, || self.current_job().map(|job| job.prev_blockhash))
    }

    /// The live negotiated job for `token`; `None` once its tip is gone.
    pub fn negotiated_job(&self, token: u64) -> Option<Arc<Job>> {
        self.commitments.get(token).map(|c| c.job.clone())
    }

    /// Drop a departed session's tokens and commitments.
    pub fn release_session(&self, session: u64) {
        self.commitments.release_session(session);
    }

    /// Assemble a solved block and hand it to the node.
    pub async fn submit_block(
        &self,
        job: &Job,
        header: Header,
        coinbase: &[u8],
    ) -> Result<BlockSubmission> {
        let block = job
            .assemble_block(header, coinbase)
            .map_err(|e| Error::UpstreamUnavailable(format!("assemble block: {}", e)))?;
        let hash = block.block_hash();
        let result = self.source.submit_block(serialize_hex(&block)).await?;
        match &result {
            BlockSubmission::Accepted => {
                info!(%hash, height = job.height, source = %job.source, "Block accepted by node")
            }
            BlockSubmission::Rejected(reason) => {
                error!(%hash, height = job.height, reason, "Block rejected by node")
            }
        }
        Ok(result)
    }

    /// Poll the template source until cancelled.
    ///
    /// While the source is unreachable the last job keeps being served and
    /// polls back off exponentially.
    pub async fn run_upstream(&self, cancel: CancellationToken) {
        let mut backoff = self.params.backoff_initial;
        loop {
            let delay = match self.source.fetch_template().await {
                Ok(template) => {
                    backoff = self.params.backoff_initial;
                    if self.wants(&template) {
                        if let Err(e) = self.install_template(&template) {
                            warn!(error = %e, "Ignoring bad template");
                        }
                    }
                    self.params.poll_interval
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "Template fetch failed");
                    let delay = backoff;
                    backoff = (backoff * 2).min(self.params.backoff_max);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Upstream polling stopped");
    }
}
