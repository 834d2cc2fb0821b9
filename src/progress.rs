use byte_unit::{AdjustedByte, Byte, UnitType};
use indicatif::ProgressStyle;
use itertools::{Itertools, Position};
use rayon::iter::{FromParallelIterator, IndexedParallelIterator, ParallelIterator};
use std::io::{stderr, IsTerminal};
use std::time::Instant;
use tracing::{info, info_span, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

pub fn display_bytes(size: u64) -> AdjustedByte {
    Byte::from(size).get_appropriate_unit(UnitType::Binary)
}

const PBAR_TEMPLATE: &str = "{span_child_prefix} {msg} {percent}% {wide_bar} {per_sec} [{human_pos}/{human_len}]";

fn setup_span_bar(size: usize, message: &'static str) -> Span {
    let span = info_span!("task", items = size);
    span.pb_set_message(message);
    span.pb_set_style(
        &ProgressStyle::default_bar()
            .template(PBAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    span.pb_set_length(size as u64);
    // The bar is shown from the first enter until the span closes.
    drop(span.enter());
    span
}

/// Collects a parallel iterator in order while driving a progress bar.
pub fn progress_parallel_collect<V: FromParallelIterator<T>, T: Send>(
    message: &'static str,
    iterator: impl IndexedParallelIterator<Item = anyhow::Result<T>>,
) -> anyhow::Result<V> {
    let span = setup_span_bar(iterator.len(), message);
    let _entered = span.enter();

    if stderr().is_terminal() {
        iterator.inspect(|_| span.pb_inc(1)).collect()
    } else {
        let start = Instant::now();
        let res = iterator.collect();
        info!("{message} completed in {:#.1?}", start.elapsed());
        res
    }
}

pub fn progress_iter<T>(
    message: &'static str,
    iterator: impl ExactSizeIterator<Item = T>,
) -> impl ExactSizeIterator<Item = T> {
    let span = setup_span_bar(iterator.len(), message);
    let is_term = stderr().is_terminal();
    let start = Instant::now();

    iterator.with_position().map(move |(pos, v)| {
        if is_term {
            span.pb_inc(1);
        } else if matches!(pos, Position::Last | Position::Only) {
            info!("{message} completed in {:#.1?}", start.elapsed());
        }
        v
    })
}
