//! Submission batching.
//!
//! `push` turns a sequence of `(command buffer, new_batch)` choices into a
//! list of batches; `resolve` chains the batches with semaphores so each one
//! waits on the one before it. The first batch waits on the frame's top
//! semaphore (image acquired), the last one signals the bottom semaphore
//! (ready to present). Command buffers inside one batch share the same
//! wait and signal and may run in parallel.

use ash::vk;

use crate::vulkan::{FrameLink, QueueTarget};

/// Stage at which a batch waits on its predecessor.
pub const CHAIN_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::ALL_COMMANDS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub target: QueueTarget,
    pub commands: Vec<vk::CommandBuffer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub target: QueueTarget,
    pub commands: Vec<vk::CommandBuffer>,
    pub wait: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal: Vec<vk::Semaphore>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionGraph {
    batches: Vec<Batch>,
}

impl SubmissionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `cmd`. It joins the open batch unless `new_batch` is set or the
    /// open batch targets another queue.
    pub fn push(&mut self, cmd: vk::CommandBuffer, new_batch: bool, target: QueueTarget) {
        match self.batches.last_mut() {
            Some(last) if !new_batch && last.target == target => last.commands.push(cmd),
            _ => self.batches.push(Batch { target, commands: vec![cmd] }),
        }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    fn effective(&self, link: &FrameLink) -> Vec<Batch> {
        let mut batches = self.batches.clone();
        if let Some(tail) = link.tail {
            batches.push(Batch { target: QueueTarget::Graphics, commands: vec![tail] });
        }
        if batches.is_empty() && (link.top != vk::Semaphore::null() || link.bottom != vk::Semaphore::null()) {
            // Nothing recorded: still connect top to bottom.
            batches.push(Batch { target: QueueTarget::Graphics, commands: Vec::new() });
        }
        batches
    }

    /// Semaphores needed between batches for `resolve`.
    pub fn chain_len(&self, link: &FrameLink) -> usize {
        self.effective(link).len().saturating_sub(1)
    }

    /// Wire the batches into a semaphore chain. `None` if `chain` holds
    /// fewer than `chain_len` semaphores.
    pub fn resolve(&self, link: &FrameLink, chain: &[vk::Semaphore]) -> Option<Vec<ResolvedBatch>> {
        let batches = self.effective(link);
        if chain.len() < batches.len().saturating_sub(1) {
            return None;
        }

        let last = batches.len().saturating_sub(1);
        let resolved = batches
            .into_iter()
            .enumerate()
            .map(|(i, batch)| {
                let (wait, wait_stages) = if i == 0 {
                    if link.top != vk::Semaphore::null() {
                        (vec![link.top], vec![link.top_stage])
                    } else {
                        (Vec::new(), Vec::new())
                    }
                } else {
                    (vec![chain[i - 1]], vec![CHAIN_WAIT_STAGE])
                };
                let signal = if i < last {
                    vec![chain[i]]
                } else if link.bottom != vk::Semaphore::null() {
                    vec![link.bottom]
                } else {
                    Vec::new()
                };
                ResolvedBatch { target: batch.target, commands: batch.commands, wait, wait_stages, signal }
            })
            .collect();
        Some(resolved)
    }
}
