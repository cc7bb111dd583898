//! Progress display for apply and destroy runs

use declarative::{ExecuteSummary, NodeOutcome, ProgressCallback, ResourceId, StepOp};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::render;

/// Progress bar fed by the scheduler's callbacks
pub struct RunProgress {
    bar: ProgressBar,
    verbose: bool,
}

impl RunProgress {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        let bar = ProgressBar::new(0);
        if quiet {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar, verbose }
    }
}

fn verb(op: &StepOp) -> &'static str {
    match op {
        StepOp::Apply => "Applying",
        StepOp::Delete => "Deleting",
        StepOp::DeleteDeposed { .. } => "Removing old object of",
    }
}

impl ProgressCallback for RunProgress {
    fn on_run_start(&mut self, steps: usize) {
        self.bar.set_length(steps as u64);
    }

    fn on_step_start(&mut self, id: &ResourceId, op: &StepOp) {
        self.bar.set_message(format!("{} {id}", verb(op)));
    }

    fn on_step_complete(&mut self, id: &ResourceId, outcome: &NodeOutcome) {
        if self.verbose || *outcome != NodeOutcome::NoChange {
            self.bar.println(format!("  {}", render::outcome(id, outcome)));
        }
        self.bar.inc(1);
    }

    fn on_run_complete(&mut self, _summary: &ExecuteSummary) {
        self.bar.finish_and_clear();
    }
}
