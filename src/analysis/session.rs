//! ScanSession: one image, one base address, one run.
//!
//! A session owns the mapped image and every per-run fact (base address,
//! class sentinels, cache, cancellation). Graphs and live sets are built
//! fresh by each [`ScanSession::run`] and handed back in a [`ScanOutcome`];
//! nothing is kept in process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::cache::{MemoryScanCache, ScanCache};
use crate::analysis::config::ScanConfig;
use crate::analysis::graph::{GraphBuild, GraphBuilder, ScanStats};
use crate::analysis::image::BinaryImage;
use crate::analysis::memory::ImageMemory;
use crate::analysis::metadata_init::MetadataInitRefs;
use crate::analysis::reachability::{classify, LiveSet, Liveness};
use crate::analysis::translate::AddressTranslator;
use crate::analysis::xrefs::{self, ClassFilter, ClassSentinels};
use crate::cancel::CancelToken;
use crate::core::address::CodeAddress;
use crate::core::call_graph::{CallGraph, CallSite};
use crate::core::method::{MethodKey, MethodNode, MethodSource, ObfuscationPolicy};
use crate::core::reference::XrefRecord;
use crate::disasm::registry;
use crate::error::{Result, ScanError};
use crate::log_error;

/// Result of one scan run.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub graph: CallGraph,
    pub live: LiveSet,
    pub stats: ScanStats,
    pub globals: HashMap<MethodKey, Vec<XrefRecord>>,
    pub metadata_init: HashMap<MethodKey, MetadataInitRefs>,
    /// The scan did not run; every method with a body counts as live.
    pub skipped: bool,
}

impl ScanOutcome {
    /// Outcome for a pass that was not needed.
    pub fn skipped(methods: &[MethodNode]) -> Self {
        let mut live = LiveSet::new();
        let graph = CallGraph::new();
        for m in methods.iter().filter(|m| m.has_body()) {
            live.mark(&graph, m.entry_rva);
        }
        Self {
            live,
            skipped: true,
            ..Self::default()
        }
    }

    pub fn verdict(&self, method: &MethodNode) -> Liveness {
        match (self.skipped, method.has_body()) {
            (_, false) => Liveness::NoBody,
            (true, true) => Liveness::Live,
            (false, true) => self.live.verdict(method),
        }
    }

    pub fn is_live(&self, method: &MethodNode) -> bool {
        self.verdict(method) == Liveness::Live
    }

    /// Methods with a body that no seed reaches.
    pub fn dead_candidates<'m>(&self, methods: &'m [MethodNode]) -> Vec<&'m MethodNode> {
        methods
            .iter()
            .filter(|m| self.verdict(m) == Liveness::DeadCandidate)
            .collect()
    }

    /// Every call site referencing `rva`.
    pub fn callers_of(&self, rva: u64) -> &[CallSite] {
        self.graph.callers_of(rva)
    }

    pub fn metadata_init_of(&self, key: &MethodKey) -> Option<&MetadataInitRefs> {
        self.metadata_init.get(key)
    }
}

/// A scan over one native image.
pub struct ScanSession {
    config: ScanConfig,
    image: BinaryImage,
    translator: AddressTranslator,
    sentinels: ClassSentinels,
    cache: Option<Arc<dyn ScanCache>>,
    cancel: CancelToken,
}

impl ScanSession {
    /// Validate `config` and map its image. Fails before any method is
    /// processed if the image cannot be mapped.
    pub fn open(config: ScanConfig) -> Result<Self> {
        config.validate()?;
        let path = config
            .image_path
            .clone()
            .ok_or_else(|| ScanError::Config("no native image configured".into()))?;
        let image = BinaryImage::open(&path).map_err(|e| log_error!(e, "opening scan session"))?;
        Self::from_image(config, image)
    }

    /// Session over an image that is already loaded.
    pub fn from_image(config: ScanConfig, image: BinaryImage) -> Result<Self> {
        config.validate()?;
        registry::for_arch_with(config.architecture, config.backend)
            .map_err(|_| ScanError::UnsupportedArchitecture(config.architecture.to_string()))?;

        let cache: Option<Arc<dyn ScanCache>> = if config.use_cache {
            Some(Arc::new(MemoryScanCache::new()))
        } else {
            None
        };
        let session = Self {
            translator: AddressTranslator::new(config.base_address),
            config,
            image,
            sentinels: ClassSentinels::default(),
            cache,
            cancel: CancelToken::new(),
        };
        session.warn_unresolved_sentinels();
        info!(
            image = ?session.image.path(),
            size = session.image.len(),
            base = session.config.base_address,
            arch = %session.config.architecture,
            "scan session ready"
        );
        Ok(session)
    }

    /// Replace the cache. Ignored when `use_cache` is off.
    pub fn with_cache(mut self, cache: Arc<dyn ScanCache>) -> Self {
        if self.config.use_cache {
            self.cache = Some(cache);
        }
        self
    }

    /// Mapped addresses of the class-identity sentinels for `Global` filtering.
    pub fn with_sentinels(mut self, sentinels: ClassSentinels) -> Self {
        self.sentinels = sentinels;
        self.warn_unresolved_sentinels();
        self
    }

    fn warn_unresolved_sentinels(&self) {
        if !self.config.skip_class_check && !self.sentinels.is_resolved() {
            warn!("class sentinels unresolved; no global xrefs will be emitted");
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    pub fn translator(&self) -> AddressTranslator {
        self.translator
    }

    pub fn sentinels(&self) -> ClassSentinels {
        self.sentinels
    }

    /// Token that aborts `build_graph`/`run` at the next method boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn with_builder<T>(&self, f: impl FnOnce(GraphBuilder<'_>) -> Result<T>) -> Result<T> {
        let memory = ImageMemory::new(&self.image, self.translator);
        let filter = if self.config.skip_class_check {
            ClassFilter::Skip
        } else {
            ClassFilter::check(&memory, self.sentinels)
        };
        let builder = GraphBuilder::new(&self.image, self.translator)
            .architecture(self.config.architecture)
            .backend(self.config.backend)
            .window_len(self.config.window_len)
            .stop_at_unconditional_branch(self.config.stop_at_unconditional_branch)
            .filter(filter)
            .cache(self.cache.as_deref())
            .cancel_token(self.cancel.clone())
            .max_workers(self.config.max_workers)
            .metadata_init_rva(self.config.metadata_init_rva);
        f(builder)
    }

    pub fn build_graph(&self, methods: &[MethodNode]) -> Result<GraphBuild> {
        self.with_builder(|b| b.build(methods))
    }

    /// Build the graph, then classify. Classification starts only once every
    /// method has been merged.
    pub fn run(&self, methods: &[MethodNode]) -> Result<ScanOutcome> {
        let build = self.build_graph(methods)?;
        let live = classify(&build.graph, methods);
        info!(
            live = live.len(),
            methods = methods.len(),
            "reachability classified"
        );
        Ok(ScanOutcome {
            graph: build.graph,
            live,
            stats: build.stats,
            globals: build.globals,
            metadata_init: build.metadata_init,
            skipped: false,
        })
    }

    /// RVA-based xrefs of one method.
    pub fn scan_method(&self, method: &MethodNode) -> Result<Vec<XrefRecord>> {
        self.with_builder(|b| b.scan_one(method))
    }

    /// Call sites targeting `method` as recorded in the cache by an earlier
    /// build. Nothing is decoded; `None` means the cache has no entry.
    pub fn cached_callers_of(&self, method: &MethodNode) -> Option<Vec<CallSite>> {
        self.cache.as_ref()?.users(&method.key)
    }

    fn targets_of(
        &self,
        method: &MethodNode,
        scan: fn(&registry::Backend, &[u8], u64) -> Vec<u64>,
    ) -> Result<Vec<u64>> {
        if !method.has_body() {
            return Ok(Vec::new());
        }
        let decoder = self.with_builder(|b| b.decoder())?;
        let start = self.translator.method_entry(method)?;
        let window = self.image.window(method.file_offset, self.config.window_len);
        scan(&decoder, window, start.value)
            .into_iter()
            .map(|t| {
                self.translator
                    .mapped_to_rva(CodeAddress::mapped(t), method)
                    .map(|rva| rva.value)
            })
            .collect()
    }

    /// RVAs of direct call and jump targets, up to the first jump.
    pub fn jump_targets(&self, method: &MethodNode) -> Result<Vec<u64>> {
        self.targets_of(method, xrefs::jump_targets)
    }

    /// RVAs of call and jump targets plus IP-relative address-of operands.
    pub fn call_and_indirect_targets(&self, method: &MethodNode) -> Result<Vec<u64>> {
        self.targets_of(method, xrefs::call_and_indirect_targets)
    }
}

/// Flag names the policy considers obfuscated. A flag already set by the
/// metadata source is kept.
pub fn apply_obfuscation_policy(methods: &mut [MethodNode], policy: &ObfuscationPolicy) {
    for m in methods {
        if !m.is_obfuscated_name && policy.is_obfuscated(&m.name) {
            m.is_obfuscated_name = true;
        }
    }
}

/// Whole-pass entry point.
///
/// The pass is skipped, with every method reported live, when no image is
/// configured or when no method name is obfuscated.
pub fn run_pass(config: &ScanConfig, source: &dyn MethodSource) -> Result<ScanOutcome> {
    config.validate()?;
    let mut methods = source.methods();
    apply_obfuscation_policy(&mut methods, &config.obfuscation_policy()?);

    if config.image_path.is_none() {
        info!("no native image configured; skipping xref scan");
        return Ok(ScanOutcome::skipped(&methods));
    }
    if !methods.iter().any(|m| m.is_obfuscated_name) {
        info!("no obfuscated methods; skipping xref scan");
        return Ok(ScanOutcome::skipped(&methods));
    }

    ScanSession::open(config.clone())?.run(&methods)
}
