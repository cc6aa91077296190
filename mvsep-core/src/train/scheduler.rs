//! Learning-rate schedule, stepped once per optimizer step.

use burn::{
    lr_scheduler::{
        cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig},
        LrScheduler,
    },
    optim::LearningRate,
    tensor::backend::Backend,
};

use crate::SeparationError;

/// Cosine annealing from `base_lr` down to 0 over `total_steps`, positioned so
/// that the next [`LrScheduler::step`] yields the rate for `start_step`.
///
/// The first call on a fresh schedule returns `base_lr`, so a resumed run
/// sees exactly the rates an uninterrupted one would.
pub fn cosine_schedule<B: Backend>(
    base_lr: LearningRate,
    total_steps: usize,
    start_step: usize,
) -> crate::Result<CosineAnnealingLrScheduler> {
    let scheduler = CosineAnnealingLrSchedulerConfig::new(base_lr, total_steps)
        .init()
        .map_err(|e| SeparationError::Config(format!("learning-rate schedule: {e}")))?;
    // The record is the index of the last rate handed out.
    Ok(scheduler.load_record::<B>(start_step.wrapping_sub(1)))
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type B = NdArray<f32>;

    #[test]
    fn anneals_from_base_to_zero() {
        let mut s = cosine_schedule::<B>(1e-3, 100, 0).unwrap();
        assert!((s.step() - 1e-3).abs() < 1e-12);

        let mut half = cosine_schedule::<B>(1e-3, 100, 50).unwrap();
        assert!((half.step() - 0.5e-3).abs() < 1e-12);

        let mut end = cosine_schedule::<B>(1e-3, 100, 100).unwrap();
        assert!(end.step().abs() < 1e-12);
    }

    #[test]
    fn monotonically_decreasing() {
        let mut s = cosine_schedule::<B>(0.1, 20, 0).unwrap();
        let mut prev = s.step();
        for _ in 0..20 {
            let lr = s.step();
            assert!(lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn fast_forward_matches_stepping() {
        let mut stepped = cosine_schedule::<B>(0.5, 37, 0).unwrap();
        for _ in 0..13 {
            stepped.step();
        }
        let mut jumped = cosine_schedule::<B>(0.5, 37, 13).unwrap();

        assert_eq!(
            LrScheduler::to_record::<B>(&stepped),
            LrScheduler::to_record::<B>(&jumped)
        );
        assert_eq!(stepped.step(), jumped.step());
    }

    #[test]
    fn empty_schedule_is_a_config_error() {
        assert!(matches!(
            cosine_schedule::<B>(1e-3, 0, 0),
            Err(SeparationError::Config(_))
        ));
    }
}
