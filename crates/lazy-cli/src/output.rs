//! A simple prefixed stdout sink for streamed task output, the `lazy-cli`
//! stand-in for `turborepo-ui`'s prefixed writers (out of this crate's size
//! budget; see SPEC_FULL.md §2.1).

use lazy_core::runner::OutputSink;

pub struct PrefixedSink;

impl OutputSink for PrefixedSink {
    fn line(&self, task_label: &str, line: &str) {
        println!("{task_label}: {line}");
    }
}
