//! Splits large reads into aligned sub-reads.
//!
//! ```text
//!   read(offset = 100, size = 700), max_read_size = 256
//!
//!   0        256       512       768
//!   │─────────┼─────────┼─────────┼──
//!      [100 ──256)[256 ──512)[512 ─800)
//!       child 0    child 1    child 2
//! ```
//!
//! Boundaries are absolute multiples of `max_read_size`, so two overlapping
//! reads of the same file produce identical sub-reads further down (which a
//! cache below can share). Each child reads into its own buffer; its hook
//! copies the bytes into the parent's buffer at the right position, growing
//! it as needed. The parent buffer is never sized up front, so its memory is
//! bounded by what was actually read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::common::exception::RequestError;
use crate::streamer::config::ReadSplitterConfig;
use crate::streamer::request::{
    CompletionHook, FileRequest, RequestCommand, SharedBuffer, shared_buffer,
};
use crate::streamer::stage::{StageLink, StreamStage};
use crate::streamer::statistics::Statistic;

pub struct ReadSplitter {
    link: StageLink,
    max_read_size: u64,
    max_sub_reads: u64,
    split_reads: u64,
    sub_reads: u64,
    rejected: u64,
}

impl ReadSplitter {
    pub fn new(config: &ReadSplitterConfig) -> Self {
        Self {
            link: StageLink::new(config.name.clone()),
            max_read_size: config.max_read_size.max(1),
            max_sub_reads: config.max_sub_reads.max(1),
            split_reads: 0,
            sub_reads: 0,
            rejected: 0,
        }
    }

    /// Largest read this splitter accepts
    pub fn max_split_size(&self) -> u64 {
        self.max_read_size.saturating_mul(self.max_sub_reads)
    }

    /// Number of sub-reads `[offset, offset + size)` splits into
    fn count_ranges(&self, offset: u64, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let last = offset.saturating_add(size) - 1;
        last / self.max_read_size - offset / self.max_read_size + 1
    }

    /// `(offset, size)` of every sub-read covering `[offset, offset + size)`
    pub fn split_ranges(&self, offset: u64, size: u64) -> Vec<(u64, u64)> {
        let end = offset.saturating_add(size);
        let mut ranges = Vec::new();
        let mut start = offset;
        while start < end {
            let boundary = (start / self.max_read_size + 1).saturating_mul(self.max_read_size);
            let chunk_end = boundary.min(end);
            ranges.push((start, chunk_end - start));
            start = chunk_end;
        }
        ranges
    }

    fn split(
        &mut self,
        request: &Arc<FileRequest>,
        path: &Path,
        offset: u64,
        size: u64,
        output: &SharedBuffer,
    ) {
        let Some(context) = self.link.context().cloned() else {
            self.link.forward_prepare(Arc::clone(request));
            return;
        };

        let limit = self.max_split_size();
        if self.count_ranges(offset, size) > self.max_sub_reads || usize::try_from(size).is_err() {
            warn!(
                "Rejecting read {} of {} bytes from {}, limit is {} bytes",
                request.id(),
                size,
                path.display(),
                limit
            );
            self.rejected += 1;
            context.fail_request(request, RequestError::TooLarge { size, limit });
            return;
        }
        output.lock().clear();

        let ranges = self.split_ranges(offset, size);
        debug!(
            "Splitting read {} of {} bytes into {} reads",
            request.id(),
            size,
            ranges.len()
        );
        self.split_reads += 1;
        self.sub_reads += ranges.len() as u64;

        let children: Vec<_> = ranges
            .into_iter()
            .map(|(child_offset, child_size)| {
                let destination = (child_offset - offset) as usize;
                context.create_internal_request(
                    request,
                    RequestCommand::Read {
                        path: PathBuf::from(path),
                        offset: child_offset,
                        size: child_size,
                    },
                    Some(shared_buffer()),
                    Some(copy_into(Arc::clone(output), destination)),
                )
            })
            .collect();

        for child in children {
            self.link.forward_prepare(child);
        }
    }
}

/// Hook that copies a completed sub-read into the parent buffer
fn copy_into(parent: SharedBuffer, destination: usize) -> CompletionHook {
    Box::new(move |child: &FileRequest| {
        if !child.status().is_success() {
            return;
        }
        let Some(source) = child.output() else {
            return;
        };
        let source = source.lock();
        let mut target = parent.lock();
        let end = destination + source.len();
        if target.len() < end {
            target.resize(end, 0);
        }
        target[destination..end].copy_from_slice(&source);
        trace!("Copied sub-read {} into parent at {}", child.id(), destination);
    })
}

impl StreamStage for ReadSplitter {
    fn link(&self) -> &StageLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut StageLink {
        &mut self.link
    }

    fn prepare_request(&mut self, request: Arc<FileRequest>) {
        if let RequestCommand::Read { path, offset, size } = request.command()
            && *size > self.max_read_size
            && let Some(output) = request.output()
        {
            let (path, offset, size, output) = (path.clone(), *offset, *size, Arc::clone(output));
            self.split(&request, &path, offset, size, &output);
            return;
        }
        self.link.forward_prepare(request);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let name = self.link.name();
        statistics.push(Statistic::byte_size(name, "Max read size", self.max_read_size));
        statistics.push(Statistic::integer(name, "Split reads", self.split_reads as i64));
        statistics.push(Statistic::integer(name, "Sub-reads", self.sub_reads as i64));
        statistics.push(Statistic::integer(name, "Rejected reads", self.rejected as i64));
        self.link.forward_statistics(statistics);
    }
}
