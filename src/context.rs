//! Explicit library context.
//!
//! An [`SfContext`] brackets one process's use of star forests: it owns the
//! configuration every new star forest starts from, the memory backends, and
//! the tag allocator that gives each star forest a private block of message
//! tags. Every rank must create its star forests in the same order so the
//! blocks agree across the group.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::algs::communicator::{CommTag, SfCommTags};
use crate::config::SfConfig;
use crate::memory::{DeviceFamily, MemoryOps, MemoryRegistry};
use crate::sf_error::SfError;

#[derive(Debug)]
pub struct SfContext {
    config: SfConfig,
    memory: MemoryRegistry,
    next_tag: AtomicU16,
    finalized: AtomicBool,
}

impl SfContext {
    pub fn initialize(config: SfConfig) -> Self {
        log::debug!("star forest context initialized: {config:?}");
        Self {
            next_tag: AtomicU16::new(config.base_tag),
            config,
            memory: MemoryRegistry::default(),
            finalized: AtomicBool::new(false),
        }
    }

    /// Context configured from `SF_*` environment variables.
    pub fn from_env() -> Result<Self, SfError> {
        Ok(Self::initialize(SfConfig::from_env()?))
    }

    pub fn config(&self) -> &SfConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryRegistry {
        &self.memory
    }

    /// Install the allocator for one accelerator family.
    pub fn register_memory(&self, family: DeviceFamily, ops: Arc<dyn MemoryOps>) {
        self.memory.register(family, ops);
    }

    /// Reserve the next block of [`SfCommTags::SPAN`] tags.
    pub(crate) fn next_tags(&self) -> Result<SfCommTags, SfError> {
        self.ensure_live()?;
        let base = self.next_tag.fetch_add(SfCommTags::SPAN, Ordering::Relaxed);
        log::trace!("allocated tag block {base:#06x}");
        Ok(SfCommTags::from_base(CommTag::new(base)))
    }

    pub(crate) fn ensure_live(&self) -> Result<(), SfError> {
        if self.finalized.load(Ordering::Acquire) {
            Err(SfError::ContextFinalized)
        } else {
            Ok(())
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// End this context's use; creating star forests afterwards fails.
    pub fn finalize(&self) {
        if !self.finalized.swap(true, Ordering::AcqRel) {
            log::debug!("star forest context finalized");
        }
    }
}

impl Default for SfContext {
    fn default() -> Self {
        Self::initialize(SfConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_blocks_are_disjoint() {
        let ctx = SfContext::initialize(SfConfig {
            base_tag: 100,
            ..Default::default()
        });
        let a = ctx.next_tags().unwrap();
        let b = ctx.next_tags().unwrap();
        assert_eq!(a.setup, CommTag::new(100));
        assert_eq!(b.setup, CommTag::new(100 + SfCommTags::SPAN));
        assert!(a.handshake < b.setup);
        let last = a.fetch_reply_slot(u64::from(SfCommTags::FETCH_SLOTS) - 1);
        assert!(last < b.setup);
        assert_eq!(a.fetch_reply_slot(u64::from(SfCommTags::FETCH_SLOTS)), a.fetch_reply);
    }

    #[test]
    fn finalized_context_refuses_new_tags() {
        let ctx = SfContext::default();
        ctx.finalize();
        ctx.finalize();
        assert!(ctx.is_finalized());
        assert_eq!(ctx.next_tags().unwrap_err(), SfError::ContextFinalized);
    }
}
