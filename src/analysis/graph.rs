//! GraphBuilder: run the extractor over every method and merge the results.
//!
//! Extraction fans out over a bounded rayon pool, one work unit per method,
//! with a decoder built per worker. Each unit returns its own result; the
//! call graph is then assembled in a single-threaded pass, so no lock is held
//! while decoding and no record can be lost to a concurrent insert.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, info_span, warn};

use crate::analysis::cache::ScanCache;
use crate::analysis::image::BinaryImage;
use crate::analysis::metadata_init::MetadataInitRefs;
use crate::analysis::translate::AddressTranslator;
use crate::analysis::xrefs::{scan_window, ClassFilter};
use crate::cancel::CancelToken;
use crate::core::address::CodeAddress;
use crate::core::call_graph::CallGraph;
use crate::core::decoder::{Architecture, DecodeError, InstructionDecoder};
use crate::core::method::{MethodKey, MethodNode};
use crate::core::reference::{XrefKind, XrefRecord};
use crate::disasm::registry::{self, Backend, BackendKind};
use crate::error::{Result, ScanError};

const PROGRESS_EVERY: usize = 1000;

/// Counters for one graph build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub methods_total: usize,
    pub methods_scanned: usize,
    pub methods_without_body: usize,
    pub cache_hits: usize,
    pub decode_failures: usize,
    pub method_xrefs: usize,
    pub global_xrefs: usize,
}

/// Everything a graph build produces.
#[derive(Debug, Clone, Default)]
pub struct GraphBuild {
    pub graph: CallGraph,
    /// `Global` records per method, RVA-based.
    pub globals: HashMap<MethodKey, Vec<XrefRecord>>,
    /// Metadata-registration globals, for methods where any were found.
    pub metadata_init: HashMap<MethodKey, MetadataInitRefs>,
    pub stats: ScanStats,
}

enum MethodScan {
    NoBody,
    Failed(DecodeError),
    Scanned {
        records: Vec<XrefRecord>,
        from_cache: bool,
        metadata: Option<MetadataInitRefs>,
    },
}

/// Drives extraction across a method set.
pub struct GraphBuilder<'a> {
    image: &'a BinaryImage,
    translator: AddressTranslator,
    architecture: Architecture,
    backend: Option<BackendKind>,
    window_len: usize,
    stop_at_unconditional_branch: bool,
    filter: ClassFilter<'a>,
    cache: Option<&'a dyn ScanCache>,
    cancel: CancelToken,
    max_workers: Option<usize>,
    metadata_init_rva: Option<u64>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(image: &'a BinaryImage, translator: AddressTranslator) -> Self {
        Self {
            image,
            translator,
            architecture: Architecture::X86_64,
            backend: None,
            window_len: crate::analysis::config::DEFAULT_WINDOW_LEN,
            stop_at_unconditional_branch: true,
            filter: ClassFilter::Skip,
            cache: None,
            cancel: CancelToken::new(),
            max_workers: None,
            metadata_init_rva: None,
        }
    }

    pub fn architecture(mut self, arch: Architecture) -> Self {
        self.architecture = arch;
        self
    }

    pub fn backend(mut self, backend: Option<BackendKind>) -> Self {
        self.backend = backend;
        self
    }

    pub fn window_len(mut self, len: usize) -> Self {
        self.window_len = len;
        self
    }

    pub fn stop_at_unconditional_branch(mut self, stop: bool) -> Self {
        self.stop_at_unconditional_branch = stop;
        self
    }

    pub fn filter(mut self, filter: ClassFilter<'a>) -> Self {
        self.filter = filter;
        self
    }

    pub fn cache(mut self, cache: Option<&'a dyn ScanCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn max_workers(mut self, workers: Option<usize>) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn metadata_init_rva(mut self, rva: Option<u64>) -> Self {
        self.metadata_init_rva = rva;
        self
    }

    /// Scan every method and assemble the call graph.
    ///
    /// Per-method decode failures are logged and contribute nothing.
    /// Cancellation is honoured between methods and returns
    /// [`ScanError::Cancelled`] with no partial graph.
    pub fn build(&self, methods: &[MethodNode]) -> Result<GraphBuild> {
        let span = info_span!("build_call_graph", methods = methods.len());
        let _guard = span.enter();

        self.decoder()?;

        let mut pool = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.max_workers {
            pool = pool.num_threads(n);
        }
        let pool = pool
            .build()
            .map_err(|e| ScanError::Internal(format!("worker pool: {e}")))?;
        debug!(workers = pool.current_num_threads(), "starting method scan");

        let arch = self.architecture;
        let scans: Vec<MethodScan> = pool.install(|| {
            methods
                .par_iter()
                .enumerate()
                .map_init(
                    || self.decoder(),
                    |decoder, (i, method)| {
                        self.cancel.check()?;
                        if i > 0 && i % PROGRESS_EVERY == 0 {
                            debug!(done = i, total = methods.len(), "scan progress");
                        }
                        let decoder = decoder.as_ref().map_err(|_| {
                            ScanError::UnsupportedArchitecture(arch.to_string())
                        })?;
                        self.scan_method(decoder, method)
                    },
                )
                .collect::<Result<Vec<_>>>()
        })?;

        let build = Self::merge(methods, scans)?;
        if let Some(cache) = self.cache {
            Self::store_users(cache, &build.graph, methods);
        }
        info!(
            scanned = build.stats.methods_scanned,
            cached = build.stats.cache_hits,
            failed = build.stats.decode_failures,
            edges = build.graph.edge_count(),
            globals = build.stats.global_xrefs,
            "call graph built"
        );
        Ok(build)
    }

    /// Scan a single method on the calling thread. Unlike [`build`](Self::build),
    /// a decode failure is returned as [`ScanError::Decode`]. A method without
    /// a body yields no records.
    pub fn scan_one(&self, method: &MethodNode) -> Result<Vec<XrefRecord>> {
        let decoder = self.decoder()?;
        match self.scan_method(&decoder, method)? {
            MethodScan::NoBody => Ok(Vec::new()),
            MethodScan::Failed(e) => Err(e.into()),
            MethodScan::Scanned { records, .. } => Ok(records),
        }
    }

    /// Decoder for this builder's architecture and back-end.
    pub fn decoder(&self) -> Result<Backend> {
        registry::for_arch_with(self.architecture, self.backend)
            .map_err(|_| ScanError::UnsupportedArchitecture(self.architecture.to_string()))
    }

    /// Record, for every method with a body, the call sites targeting it.
    fn store_users(cache: &dyn ScanCache, graph: &CallGraph, methods: &[MethodNode]) {
        for method in methods.iter().filter(|m| m.has_body()) {
            if let Err(e) = cache.store_users(&method.key, graph.callers_of(method.entry_rva)) {
                warn!(method = %method.key, error = %e, "could not cache users");
            }
        }
    }

    fn merge(methods: &[MethodNode], scans: Vec<MethodScan>) -> Result<GraphBuild> {
        let mut build = GraphBuild::default();
        build.stats.methods_total = methods.len();

        for (method, scan) in methods.iter().zip(scans) {
            match scan {
                MethodScan::NoBody => build.stats.methods_without_body += 1,
                MethodScan::Failed(_) => build.stats.decode_failures += 1,
                MethodScan::Scanned {
                    records,
                    from_cache,
                    metadata,
                } => {
                    build.stats.methods_scanned += 1;
                    if from_cache {
                        build.stats.cache_hits += 1;
                    }
                    if let Some(refs) = metadata.filter(|r| !r.is_empty()) {
                        build.metadata_init.insert(method.key.clone(), refs);
                    }
                    let mut globals = Vec::new();
                    for record in records {
                        match record.kind {
                            XrefKind::Method => {
                                build.stats.method_xrefs += 1;
                                build.graph.insert(method.rva(), record)?;
                            }
                            XrefKind::Global => {
                                build.stats.global_xrefs += 1;
                                globals.push(record);
                            }
                        }
                    }
                    if !globals.is_empty() {
                        build.globals.insert(method.key.clone(), globals);
                    }
                }
            }
        }
        Ok(build)
    }

    /// Scan one method, returning RVA-based records.
    fn scan_method<D>(&self, decoder: &D, method: &MethodNode) -> Result<MethodScan>
    where
        D: InstructionDecoder + ?Sized,
    {
        if !method.has_body() {
            return Ok(MethodScan::NoBody);
        }

        let start = self.translator.method_entry(method)?;
        let window = self.image.window(method.file_offset, self.window_len);
        let metadata = match self.metadata_init_rva {
            Some(rva) => {
                let routine = self.translator.rva_to_mapped(CodeAddress::rva(rva), method)?;
                let base = self.translator.method_base(method).value;
                Some(MetadataInitRefs::find(
                    decoder,
                    window,
                    start.value,
                    routine.value,
                    |a| a.wrapping_sub(base),
                ))
            }
            None => None,
        };

        if let Some(hit) = self.cache.and_then(|c| c.lookup(&method.key)) {
            let records = if hit.is_known_empty() {
                Vec::new()
            } else {
                self.refilter(hit.records, method)?
            };
            return Ok(MethodScan::Scanned {
                records,
                from_cache: true,
                metadata,
            });
        }

        let records = match scan_window(
            decoder,
            window,
            start,
            self.filter,
            self.stop_at_unconditional_branch,
        )? {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    method = %method.key,
                    file_offset = method.file_offset,
                    error = %e,
                    "decode failed; method contributes no edges"
                );
                return Ok(MethodScan::Failed(e));
            }
        };

        let base = self.translator.method_base(method);
        let records = records
            .iter()
            .map(|r| r.relative_to_base(base))
            .collect::<Result<Vec<_>>>()?;

        if let Some(cache) = self.cache {
            if let Err(e) = cache.store(&method.key, &records) {
                warn!(method = %method.key, error = %e, "could not cache scan result");
            }
        }

        Ok(MethodScan::Scanned {
            records,
            from_cache: false,
            metadata,
        })
    }

    /// Cached `Global` records go through the class filter again; method
    /// records always pass.
    fn refilter(&self, records: Vec<XrefRecord>, method: &MethodNode) -> Result<Vec<XrefRecord>> {
        if matches!(self.filter, ClassFilter::Skip) {
            return Ok(records);
        }
        let mut kept = Vec::with_capacity(records.len());
        for r in records {
            if r.kind == XrefKind::Global {
                let mapped = self.translator.rva_to_mapped(r.target, method)?;
                if !self.filter.accepts(mapped.value) {
                    continue;
                }
            }
            kept.push(r);
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cache::MemoryScanCache;

    const BASE: u64 = 0x1_8000_0000;

    fn call_at(img: &mut [u8], at: usize, to: usize) {
        let rel = (to as i64 - (at as i64 + 5)) as i32;
        img[at] = 0xE8;
        img[at + 1..at + 5].copy_from_slice(&rel.to_le_bytes());
        img[at + 5] = 0xC3;
    }

    fn image() -> BinaryImage {
        let mut img = vec![0xCCu8; 0x400];
        call_at(&mut img, 0x100, 0x200);
        call_at(&mut img, 0x200, 0x300);
        img[0x300] = 0xC3;
        BinaryImage::from_bytes(img)
    }

    fn methods() -> Vec<MethodNode> {
        vec![
            MethodNode::new("A", "A", 0x100, 0x100),
            MethodNode::new("B", "B", 0x200, 0x200).obfuscated(true),
            MethodNode::new("C", "C", 0x300, 0x300).obfuscated(true),
            MethodNode::new("D", "D", 0, 0),
        ]
    }

    #[test]
    fn builds_edges_and_stats() {
        let img = image();
        let build = GraphBuilder::new(&img, AddressTranslator::new(BASE))
            .max_workers(Some(2))
            .build(&methods())
            .unwrap();

        assert_eq!(build.graph.callees_of(0x100).collect::<Vec<_>>(), vec![0x200]);
        assert_eq!(build.graph.callees_of(0x200).collect::<Vec<_>>(), vec![0x300]);
        assert!(!build.graph.has_callees(0x300));
        assert_eq!(build.graph.callers_of(0x200)[0].caller, 0x100);
        assert_eq!(
            build.graph.callers_of(0x200)[0].record.found_at,
            CodeAddress::rva(0x100)
        );

        assert_eq!(build.stats.methods_total, 4);
        assert_eq!(build.stats.methods_scanned, 3);
        assert_eq!(build.stats.methods_without_body, 1);
        assert_eq!(build.stats.method_xrefs, 2);
    }

    #[test]
    fn cache_is_populated_then_used() {
        let img = image();
        let cache = MemoryScanCache::new();
        let builder = GraphBuilder::new(&img, AddressTranslator::new(BASE)).cache(Some(&cache));

        let first = builder.build(&methods()).unwrap();
        assert_eq!(first.stats.cache_hits, 0);
        assert_eq!(cache.len(), 3);

        let second = builder.build(&methods()).unwrap();
        assert_eq!(second.stats.cache_hits, 3);
        assert_eq!(second.graph, first.graph);
    }

    #[test]
    fn decode_failure_contributes_nothing() {
        let mut img = vec![0xCCu8; 0x400];
        call_at(&mut img, 0x100, 0x200);
        img[0x200] = 0x06;
        let img = BinaryImage::from_bytes(img);
        let methods = vec![
            MethodNode::new("A", "A", 0x100, 0x100),
            MethodNode::new("Bad", "Bad", 0x200, 0x200),
        ];
        let build = GraphBuilder::new(&img, AddressTranslator::new(BASE))
            .build(&methods)
            .unwrap();
        assert_eq!(build.stats.decode_failures, 1);
        assert_eq!(build.graph.edge_count(), 1);
        assert!(!build.graph.has_callees(0x200));

        let one = GraphBuilder::new(&img, AddressTranslator::new(BASE)).scan_one(&methods[1]);
        assert!(matches!(one, Err(ScanError::Decode(_))));
    }

    #[test]
    fn cancelled_build_returns_error() {
        let img = image();
        let token = CancelToken::new();
        token.cancel();
        let res = GraphBuilder::new(&img, AddressTranslator::new(BASE))
            .cancel_token(token)
            .build(&methods());
        assert!(matches!(res, Err(ScanError::Cancelled)));
    }
}
