//! Which network an update trains, and at what learning rate.

use serde::Serialize;

/// The network a single minibatch update trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Generator,
    Discriminator,
}

/// One generator update followed by `k` discriminator updates, repeated.
///
/// Update `n` (counting from 0 over the whole run) trains the generator when
/// `n % (k + 1) == 0`.
#[derive(Debug, Clone)]
pub struct UpdateSchedule {
    k: usize,
    n_updates: usize,
}

impl UpdateSchedule {
    pub fn new(k: usize) -> Self {
        Self { k, n_updates: 0 }
    }

    pub fn step_for(&self, n_updates: usize) -> Step {
        if n_updates % (self.k + 1) == 0 {
            Step::Generator
        } else {
            Step::Discriminator
        }
    }

    /// The step the next update performs.
    pub fn current(&self) -> Step {
        self.step_for(self.n_updates)
    }

    /// Continues a run that has already performed `n_updates` updates.
    pub fn resume_at(&mut self, n_updates: usize) {
        self.n_updates = n_updates;
    }

    /// Records a finished update.
    pub fn advance(&mut self) {
        self.n_updates += 1;
    }

    pub fn n_updates(&self) -> usize {
        self.n_updates
    }

    /// Generator updates among the first `n` updates of a run.
    pub fn generator_updates_in(&self, n: usize) -> usize {
        n.div_ceil(self.k + 1)
    }
}

/// Constant for `niter` epochs, then lowered by `lr / niter_decay` after
/// every further epoch until it reaches zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    pub lr: f32,
    pub niter: usize,
    pub niter_decay: usize,
}

impl LearningRateSchedule {
    pub fn new(lr: f32, niter: usize, niter_decay: usize) -> Self {
        Self { lr, niter, niter_decay }
    }

    /// Rate in effect once `n_epochs` epochs have completed.
    pub fn rate_after(&self, n_epochs: usize) -> f32 {
        if self.niter_decay == 0 {
            return self.lr;
        }
        let decayed = n_epochs.saturating_sub(self.niter) as f32;
        (self.lr - self.lr / self.niter_decay as f32 * decayed).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn alternates_with_k_one() {
        let mut s = UpdateSchedule::new(1);
        let mut steps = Vec::new();
        for _ in 0..5 {
            steps.push(s.current());
            s.advance();
        }
        use Step::*;
        assert_eq!(steps, vec![Generator, Discriminator, Generator, Discriminator, Generator]);
        assert_eq!(s.n_updates(), 5);
        assert_eq!(s.generator_updates_in(5), 3);
    }

    #[test]
    fn resumed_schedule_keeps_the_alternation() {
        let mut s = UpdateSchedule::new(2);
        s.resume_at(7);
        assert_eq!(s.n_updates(), 7);
        // 7 % 3 == 1, 8 % 3 == 2, 9 % 3 == 0
        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(s.current());
            s.advance();
        }
        assert_eq!(steps, vec![Step::Discriminator, Step::Discriminator, Step::Generator]);
    }

    #[test]
    fn generator_count_is_ceil_of_n_over_k_plus_one() {
        for k in 0..4 {
            let s = UpdateSchedule::new(k);
            for n in 0..30 {
                let counted = (0..n).filter(|&i| s.step_for(i) == Step::Generator).count();
                assert_eq!(counted, s.generator_updates_in(n), "k={k} n={n}");
            }
        }
    }

    #[test]
    fn learning_rate_decays_linearly_after_niter() {
        let s = LearningRateSchedule::new(1e-4, 150, 200);
        assert_eq!(s.rate_after(0), 1e-4);
        assert_eq!(s.rate_after(150), 1e-4);
        assert_abs_diff_eq!(s.rate_after(151), 1e-4 * 199.0 / 200.0, epsilon = 1e-10);
        assert_abs_diff_eq!(s.rate_after(250), 0.5e-4, epsilon = 1e-9);
        assert_abs_diff_eq!(s.rate_after(350), 0.0, epsilon = 1e-10);
        assert_eq!(s.rate_after(400), 0.0);
        assert_eq!(LearningRateSchedule::new(0.1, 1, 0).rate_after(9), 0.1);
    }
}
