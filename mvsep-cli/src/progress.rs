use indicatif::{ProgressBar, ProgressStyle};
use mvsep_core::listener::{PipelineEvent, PipelineListener};

/// CLI progress bars for training steps and inference chunks.
///
/// The bar is created when a run announces its length and finished when the
/// run reports completion.
#[derive(Default)]
pub struct CliListener {
    pb: Option<ProgressBar>,
}

impl CliListener {
    fn start(&mut self, len: usize, label: &str) -> &ProgressBar {
        let pb = ProgressBar::new(len as u64);
        let template = format!("{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}}) {{msg}}");
        pb.set_style(
            ProgressStyle::with_template(&template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.pb.insert(pb)
    }
}

impl PipelineListener for CliListener {
    fn on_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::InferenceStarted { chunks, .. } => {
                self.start(chunks, "Separating");
            }
            PipelineEvent::ChunkDone { .. } => {
                if let Some(pb) = &self.pb {
                    pb.inc(1);
                }
            }
            PipelineEvent::InferenceDone { .. } => {
                if let Some(pb) = self.pb.take() {
                    pb.finish_with_message("done");
                }
            }
            PipelineEvent::TrainingStarted {
                start_step,
                total_steps,
                ..
            } => {
                self.start(total_steps, "Training").set_position(start_step as u64);
            }
            PipelineEvent::Resumed { step, avg_loss } => {
                if let Some(pb) = &self.pb {
                    pb.println(format!(
                        "Resumed from step {step} with average loss {avg_loss:.6}"
                    ));
                }
            }
            PipelineEvent::StepDone {
                step,
                epoch,
                loss,
                avg_loss,
                skipped,
                ..
            } => {
                if let Some(pb) = &self.pb {
                    pb.set_position(step as u64);
                    let note = if skipped { " (skipped)" } else { "" };
                    pb.set_message(format!(
                        "epoch {} loss {loss:.6} avg {avg_loss:.6}{note}",
                        epoch + 1
                    ));
                }
            }
            PipelineEvent::CheckpointSaved { path, .. } => {
                if let Some(pb) = &self.pb {
                    pb.println(format!("Saved {}", path.display()));
                }
            }
            PipelineEvent::TrainingDone { .. } => {
                if let Some(pb) = self.pb.take() {
                    pb.finish_with_message("done");
                }
            }
            PipelineEvent::EpochStarted { .. } => {}
        }
    }
}
