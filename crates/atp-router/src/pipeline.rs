//! # Routing Pipeline
//!
//! Per-frame orchestration of the core: an inbound frame is ABAC-checked,
//! candidates are scored through the prior-aware scorer, the frame is
//! admitted under fair queueing, and oversized payloads leave as fragment
//! sets. The transport surface on either side is out of scope — callers
//! feed frames in and carry frames out.

use crate::abac::{Context, Decision, PolicyEngine};
use crate::aimd::AimdController;
use crate::priors::{Candidate, PriorAwareScorer, ReinforcementPriorManager, ScoredCandidate};
use crate::scheduler::{FairScheduler, SchedulerConfig};
use atp_common::metrics::Registry;
use atp_proto::frag::{FragmentationPolicy, Fragmenter};
use atp_proto::frame::Frame;
use atp_proto::reassembly::{Reassembler, ReassemblerConfig};
use std::sync::Arc;
use tracing::debug;

/// Pipeline configuration: one knob bundle per stage.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub scheduler: SchedulerConfig,
    pub fragmentation: FragmentationPolicy,
    pub reassembly: ReassemblerConfig,
}

impl RouterConfig {
    /// Defaults with scheduler environment overrides applied.
    pub fn from_env() -> Self {
        RouterConfig {
            scheduler: SchedulerConfig::from_env(),
            ..RouterConfig::default()
        }
    }
}

/// Result of pushing one frame through the pipeline.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Policy said no; nothing was scheduled.
    Denied { decision: Decision },
    /// Admitted. `frames` is the original frame or its fragment set; the
    /// caller must [`RouterCore::complete`] the session when done.
    Routed {
        decision: Decision,
        selection: Option<ScoredCandidate>,
        frames: Vec<Frame>,
    },
}

/// The assembled routing core.
pub struct RouterCore {
    policy: PolicyEngine,
    scorer: PriorAwareScorer,
    scheduler: Arc<FairScheduler>,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    priors: Arc<ReinforcementPriorManager>,
}

impl RouterCore {
    pub fn new(config: RouterConfig, aimd: Arc<AimdController>, registry: &Registry) -> Self {
        let priors = Arc::new(ReinforcementPriorManager::new(registry));
        RouterCore {
            policy: PolicyEngine::new(registry),
            scorer: PriorAwareScorer::new(registry, Arc::clone(&priors)),
            scheduler: Arc::new(FairScheduler::new(config.scheduler, aimd, registry)),
            fragmenter: Fragmenter::new(config.fragmentation, registry),
            reassembler: Reassembler::new(config.reassembly, registry),
            priors,
        }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn scorer(&self) -> &PriorAwareScorer {
        &self.scorer
    }

    pub fn scheduler(&self) -> &Arc<FairScheduler> {
        &self.scheduler
    }

    pub fn priors(&self) -> &Arc<ReinforcementPriorManager> {
        &self.priors
    }

    /// The far-end reassembler for inbound fragment sets.
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Route one frame: ABAC gate, candidate scoring, fair admission,
    /// fragmentation. Blocks until the scheduler grants admission.
    pub fn handle_frame(
        &self,
        frame: &Frame,
        ctx: &Context,
        candidates: Vec<Candidate>,
    ) -> RouteOutcome {
        let decision = self.policy.evaluate_abac(ctx);
        if !decision.permitted {
            debug!(session = %frame.session_id, "frame denied by policy");
            return RouteOutcome::Denied { decision };
        }

        let mut scored = self.scorer.score_candidates(candidates);
        let selection = if scored.is_empty() {
            None
        } else {
            Some(scored.remove(0))
        };

        let grant = self.scheduler.enqueue(&frame.session_id);
        grant.wait();

        let max_size = self.fragmenter.policy().max_fragment_size(frame);
        let frames = if frame.payload.content.len() > max_size {
            self.fragmenter.fragment(frame)
        } else {
            vec![frame.clone()]
        };

        RouteOutcome::Routed {
            decision,
            selection,
            frames,
        }
    }

    /// Report a routed frame finished, freeing its admission slot.
    pub fn complete(&self, session_id: &str) {
        self.scheduler.release(session_id);
    }
}
