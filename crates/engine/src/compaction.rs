//! Compaction: merges the oldest run of segments into fewer, larger ones.
//!
//! The run always starts at the oldest live segment, so no older data can
//! exist underneath it and every tombstone in the merged output can be
//! dropped together with the values it shadows. Output is split at
//! `target_segment_bytes`. The manifest swap is the commit point: a failure
//! before it leaves the old segments in place and removes any output files.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use sstable::{segment_file_name, MergeIterator, SSTableWriter};
use tracing::info;

use crate::{Engine, EngineError, Segment};

impl Engine {
    /// Compacts the oldest run of up to `max_compaction_inputs` segments.
    ///
    /// Unlike the automatic trigger this also rewrites a lone segment, which
    /// purges its tombstones.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] outside `Serving`; read, write or
    /// manifest errors that persisted through `max_retries` attempts.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.ensure_serving()?;
        self.with_retries("compaction", || self.compact_oldest(1))?;
        Ok(())
    }

    /// Runs one compaction if the segment count has reached the trigger.
    pub(crate) fn maybe_compact(&self) -> Result<bool, EngineError> {
        let trigger = self.config.compaction_trigger;
        if trigger == 0 || self.view().segments.len() < trigger.max(2) {
            return Ok(false);
        }
        self.with_retries("compaction", || self.compact_oldest(2))
    }

    /// Returns `false` if fewer than `min_inputs` segments exist.
    fn compact_oldest(&self, min_inputs: usize) -> Result<bool, EngineError> {
        let mut manifest = self.manifest.lock();
        let view = self.view();
        let take = view.segments.len().min(self.config.max_compaction_inputs);
        if take == 0 || take < min_inputs {
            return Ok(false);
        }
        let inputs: Vec<Arc<Segment>> = view.segments[..take].to_vec();
        let started = Instant::now();

        let mut outputs = Vec::new();
        if let Err(e) = self.write_compacted(&inputs, &mut outputs) {
            discard(&outputs);
            return Err(e);
        }

        let input_numbers: Vec<u64> = inputs.iter().map(|s| s.number).collect();
        let output_numbers: Vec<u64> = outputs.iter().map(|s| s.number).collect();
        let mut next = manifest.clone();
        if !next.replace_segments(&input_numbers, &output_numbers) {
            discard(&outputs);
            return Err(EngineError::Manifest(
                "compaction inputs are not a run of the segment list".into(),
            ));
        }
        next.next_file_number = self.next_file.load(Ordering::SeqCst);
        if let Err(e) = next.save() {
            discard(&outputs);
            return Err(e);
        }
        *manifest = next;

        self.update_view(|v| {
            v.segments.splice(0..take, outputs.iter().cloned());
        });
        for input in &inputs {
            input.retire();
        }
        self.counters.compactions.fetch_add(1, Ordering::Relaxed);

        info!(
            inputs = ?input_numbers,
            outputs = ?output_numbers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compacted segments"
        );
        Ok(true)
    }

    /// Streams the merge of `inputs` into new segments, appending each
    /// finished one to `outputs`.
    fn write_compacted(
        &self,
        inputs: &[Arc<Segment>],
        outputs: &mut Vec<Arc<Segment>>,
    ) -> Result<(), EngineError> {
        let expected: usize = inputs.iter().map(|s| s.reader.entry_count() as usize).sum();
        let sources = inputs.iter().map(|s| s.reader.iter()).collect();
        let target = self.config.target_segment_bytes;

        let mut current: Option<(u64, SSTableWriter)> = None;
        for item in MergeIterator::new(sources) {
            let (key, entry) = item?;
            if entry.is_tombstone() {
                continue;
            }
            if current.is_none() {
                let number = self.next_file.fetch_add(1, Ordering::SeqCst);
                let path = self.config.data_dir.join(segment_file_name(number));
                current = Some((number, SSTableWriter::create(&path, expected, self.writer_options())?));
            }
            let Some((_, writer)) = current.as_mut() else {
                continue;
            };
            writer.add(&key, &entry)?;
            if writer.estimated_size() >= target {
                if let Some((number, writer)) = current.take() {
                    outputs.push(self.finish_output(number, writer)?);
                }
            }
        }
        if let Some((number, writer)) = current.take() {
            outputs.push(self.finish_output(number, writer)?);
        }
        Ok(())
    }

    fn finish_output(&self, number: u64, writer: SSTableWriter) -> Result<Arc<Segment>, EngineError> {
        let info = writer.finish()?;
        match Segment::open(&self.config.data_dir, number, false) {
            Ok(segment) => Ok(Arc::new(segment)),
            Err(e) => {
                let _ = fs::remove_file(&info.path);
                Err(e.into())
            }
        }
    }
}

/// Marks uncommitted outputs for deletion; the files go with the last `Arc`.
fn discard(outputs: &[Arc<Segment>]) {
    for segment in outputs {
        segment.retire();
    }
}
