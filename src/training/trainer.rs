//! The adversarial training loop.

use super::log::{EpochRecord, NdjsonLog};
use super::sampling::normal_latent;
use super::schedule::{LearningRateSchedule, Step, UpdateSchedule};
use super::{Result, TrainError};
use crate::config::RunConfig;
use crate::data::{DataLoader, ImageSet};
use crate::losses::GanCosts;
use crate::network::{Discriminator, Generator};
use crate::optimizers::Adam;
use crate::runtime::{CpuBackend, Function, Updates};
use crate::serialization::{save_safetensors, CheckpointInfo, CheckpointManager, RunState};
use crate::tensor::{GraphContext, Tensor};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one epoch.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub record: EpochRecord,
    /// Learning rate for the next epoch.
    pub lr: f32,
    /// Generator output for the fixed sample latent.
    pub samples: ArrayD<f32>,
}

/// Trains a generator and a discriminator built on one shared graph.
///
/// Both step functions take `[X, Z0]` and report
/// `[g_cost, d_cost, g_cost_d, d_cost_real, d_cost_gen]`. The generator step
/// updates only generator parameters and the discriminator step only
/// discriminator parameters, each with its own Adam state.
pub struct GanTrainer {
    config: RunConfig,
    generator: Generator,
    discriminator: Discriminator,
    train_g: Function,
    train_d: Function,
    gen: Function,
    backend: CpuBackend,
    rng: StdRng,
    schedule: UpdateSchedule,
    lr_schedule: LearningRateSchedule,
    sample_z0: ArrayD<f32>,
    n_epochs: usize,
    n_examples: usize,
    /// Seconds trained before a resume.
    seconds_before: f64,
    started: Instant,
}

fn scalar(value: &ArrayD<f32>) -> f32 {
    value.iter().copied().next().unwrap_or(f32::NAN)
}

fn mean(sum: f32, count: usize) -> Option<f32> {
    (count > 0).then(|| sum / count as f32)
}

impl GanTrainer {
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let context = Rc::new(RefCell::new(GraphContext::with_seed(config.seed)));
        let generator = Generator::new(&context, &config.generator_config())?;
        let discriminator = Discriminator::new(&context, &config.discriminator_config())?;

        let x = Tensor::new_input(&context, "X");
        let z0 = Tensor::new_input(&context, "Z0");
        let gx = generator.apply(&z0);
        let p_real = discriminator.apply(&x);
        let p_gen = discriminator.apply(&gx);

        let gen_params = generator.params();
        let disc_params = discriminator.params();
        let costs = GanCosts::new(&context, &p_real, &p_gen, &gen_params, &disc_params);
        let outputs = costs.outputs();
        let outputs: Vec<&Tensor> = outputs.iter().collect();

        let adam = config.adam_config();
        let started = Instant::now();
        let train_g = Function::compile(
            &context,
            &[&x, &z0],
            &outputs,
            Some(Updates::new(gen_params, costs.g_cost.clone(), Adam::new(adam))),
        )?;
        let train_d = Function::compile(
            &context,
            &[&x, &z0],
            &outputs,
            Some(Updates::new(disc_params, costs.d_cost.clone(), Adam::new(adam))),
        )?;
        let gen = Function::compile(&context, &[&z0], &[&gx], None)?;
        info!(
            seconds = started.elapsed().as_secs_f64(),
            graph_nodes = context.borrow().main_graph().len(),
            "compiled training functions"
        );

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(2));
        let sample_z0 = normal_latent(&mut rng, config.n_samples, config.nz0);
        Ok(Self {
            backend: CpuBackend::with_seed(config.seed.wrapping_add(1)),
            rng,
            schedule: UpdateSchedule::new(config.k),
            lr_schedule: LearningRateSchedule::new(config.lr, config.niter, config.niter_decay),
            sample_z0,
            n_epochs: 0,
            n_examples: 0,
            seconds_before: 0.0,
            started: Instant::now(),
            generator,
            discriminator,
            train_g,
            train_d,
            gen,
            config,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn n_epochs(&self) -> usize {
        self.n_epochs
    }

    pub fn n_updates(&self) -> usize {
        self.schedule.n_updates()
    }

    /// Current `(generator, discriminator)` learning rates.
    pub fn learning_rates(&self) -> (Option<f32>, Option<f32>) {
        (self.train_g.learning_rate(), self.train_d.learning_rate())
    }

    /// Wraps a dataset in a loader shuffled from the run seed.
    pub fn loader(&self, images: ImageSet) -> Result<DataLoader<ImageSet>> {
        let (nc, npx) = (self.config.nc, self.config.npx);
        if images.channels() != nc || images.side() != npx {
            return Err(TrainError::DataMismatch {
                expected: format!("{nc}x{npx}x{npx}"),
                found: format!("{}x{}x{}", images.channels(), images.side(), images.side()),
            });
        }
        Ok(DataLoader::new(images, self.config.nbatch)?.shuffled(Some(self.config.seed)))
    }

    pub fn n_examples(&self) -> usize {
        self.n_examples
    }

    fn n_seconds(&self) -> f64 {
        self.seconds_before + self.started.elapsed().as_secs_f64()
    }

    /// Runs one minibatch update and returns the five reported costs.
    /// `images` must be a non-empty `(batch, nc, npx, npx)` array.
    pub fn update(&mut self, images: ArrayD<f32>) -> Result<(Step, Vec<f32>)> {
        let (nc, npx) = (self.config.nc, self.config.npx);
        let shape = images.shape();
        if shape.len() != 4 || shape[0] == 0 || shape[1..] != [nc, npx, npx] {
            return Err(TrainError::DataMismatch {
                expected: format!("(batch, {nc}, {npx}, {npx})"),
                found: format!("{shape:?}"),
            });
        }
        let z0 = normal_latent(&mut self.rng, images.shape()[0], self.config.nz0);
        let feed = [images, z0];
        let step = self.schedule.current();
        let function = match step {
            Step::Generator => &mut self.train_g,
            Step::Discriminator => &mut self.train_d,
        };
        let outputs = function
            .call(&self.backend, &feed)
            .map_err(|e| TrainError::from_function(e, self.schedule.n_updates()))?;
        self.schedule.advance();
        Ok((step, outputs.iter().map(scalar).collect()))
    }

    /// One pass over `loader`, then samples from the fixed latent and lowers
    /// the learning rate once past `niter` epochs.
    pub fn train_epoch(&mut self, loader: &mut DataLoader<ImageSet>) -> Result<EpochReport> {
        let (mut g_sum, mut g_iter, mut d_sum, mut d_iter) = (0.0f32, 0usize, 0.0f32, 0usize);
        for batch in loader.epoch() {
            let n = batch.len();
            let (step, costs) = self.update(batch.images)?;
            match step {
                Step::Generator => {
                    g_sum += costs[0];
                    g_iter += 1;
                }
                Step::Discriminator => {
                    d_sum += costs[1];
                    d_iter += 1;
                }
            }
            self.n_examples += n;
            debug!(update = self.schedule.n_updates(), ?step, cost = ?costs, "minibatch");
        }

        let samples = self.sample(self.sample_z0.clone())?;
        self.n_epochs += 1;
        let lr = self.lr_schedule.rate_after(self.n_epochs);
        self.train_g.set_learning_rate(lr);
        self.train_d.set_learning_rate(lr);

        let record = EpochRecord {
            n_epochs: self.n_epochs,
            n_updates: self.schedule.n_updates(),
            n_examples: self.n_examples,
            n_seconds: self.n_seconds(),
            g_cost: mean(g_sum, g_iter),
            d_cost: mean(d_sum, d_iter),
        };
        info!(
            epoch = record.n_epochs,
            updates = record.n_updates,
            g_cost = ?record.g_cost,
            d_cost = ?record.d_cost,
            lr,
            "finished epoch"
        );
        Ok(EpochReport { record, lr, samples })
    }

    /// Generator output for an `(n, nz0)` latent batch.
    pub fn sample(&mut self, z0: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if z0.ndim() != 2 || z0.shape()[1] != self.config.nz0 {
            return Err(TrainError::LatentShape {
                shape: z0.shape().to_vec(),
                nz0: self.config.nz0,
            });
        }
        let mut out = self
            .gen
            .call(&self.backend, &[z0])
            .map_err(|e| TrainError::from_function(e, self.schedule.n_updates()))?;
        Ok(out.remove(0))
    }

    /// Trains for `epochs` more epochs, writing the run artifacts under the
    /// experiment directory: `config.json` and milestone checkpoints in the
    /// model directory, per-epoch samples, and one log line per epoch.
    pub fn fit(&mut self, loader: &mut DataLoader<ImageSet>, epochs: usize) -> Result<Vec<EpochRecord>> {
        let checkpoints = CheckpointManager::new(self.config.model_dir())?;
        checkpoints.write_manifest(&self.config)?;
        let sample_dir = self.config.sample_dir();
        fs::create_dir_all(&sample_dir)?;
        let mut log = NdjsonLog::open(self.config.log_path())?;
        let total = self.config.total_epochs();
        if self.config.niter_decay > 0 && self.n_epochs + epochs > total {
            warn!(
                total,
                requested = self.n_epochs + epochs,
                "training past the decay schedule, the learning rate stays at zero"
            );
        }
        info!(
            desc = %self.config.desc,
            images = loader.len(),
            batches = loader.num_batches(),
            epochs,
            "starting training"
        );

        let mut records = Vec::with_capacity(epochs);
        for _ in 0..epochs {
            let report = self.train_epoch(loader)?;
            let epoch = report.record.n_epochs;
            self.save_samples(sample_dir.join(format!("{epoch}.safetensors")), report.samples)?;
            if self.config.milestones.contains(&epoch) {
                checkpoints.save(epoch, &self.generator.params())?;
                checkpoints.save(epoch, &self.discriminator.params())?;
                checkpoints.save_state(&self.run_state())?;
            }
            log.append(&report.record)?;
            records.push(report.record);
        }
        Ok(records)
    }

    fn save_samples(&self, path: PathBuf, samples: ArrayD<f32>) -> Result<()> {
        let metadata = HashMap::from([("epoch".to_string(), self.n_epochs.to_string())]);
        save_safetensors(&path, &[("samples".to_string(), samples)], metadata)?;
        Ok(())
    }

    fn run_state(&self) -> RunState {
        RunState {
            n_epochs: self.n_epochs,
            n_updates: self.schedule.n_updates(),
            n_examples: self.n_examples,
            n_seconds: self.n_seconds(),
        }
    }

    /// Restores both networks and the run counters saved after `epoch`, and
    /// resumes the update alternation and learning rate from there.
    pub fn resume(&mut self, epoch: usize) -> Result<CheckpointInfo> {
        let checkpoints = CheckpointManager::new(self.config.model_dir())?;
        let state = checkpoints.load_state(epoch)?;
        let info = checkpoints.restore(epoch, &self.generator.params())?;
        checkpoints.restore(epoch, &self.discriminator.params())?;
        self.n_epochs = epoch;
        self.schedule.resume_at(state.n_updates);
        self.n_examples = state.n_examples;
        self.seconds_before = state.n_seconds;
        self.started = Instant::now();
        let lr = self.lr_schedule.rate_after(epoch);
        self.train_g.set_learning_rate(lr);
        self.train_d.set_learning_rate(lr);
        info!(epoch, lr, n_updates = state.n_updates, "resumed from checkpoints");
        Ok(info)
    }
}

impl std::fmt::Debug for GanTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GanTrainer")
            .field("desc", &self.config.desc)
            .field("n_epochs", &self.n_epochs)
            .field("n_updates", &self.schedule.n_updates())
            .field("n_examples", &self.n_examples)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn tiny_config(exp_dir: &std::path::Path) -> RunConfig {
        RunConfig {
            nbatch: 4,
            npx: 16,
            nz0: 4,
            nz1: 2,
            ngf: 2,
            ndf: 2,
            ndfc: 8,
            niter: 1,
            niter_decay: 2,
            n_samples: 3,
            milestones: vec![1, 2],
            seed: 9,
            exp_dir: exp_dir.to_path_buf(),
            desc: "tiny".to_string(),
            ..RunConfig::default()
        }
    }

    fn images(n: usize) -> ImageSet {
        let data = ArrayD::random(IxDyn(&[n, 3, 16, 16]), Uniform::new(-1.0f32, 1.0));
        ImageSet::from_array(data, 3, 16).unwrap()
    }

    #[test]
    fn epoch_alternates_updates_and_decays_lr() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = GanTrainer::new(tiny_config(dir.path())).unwrap();
        let mut loader = trainer.loader(images(10)).unwrap();

        let report = trainer.train_epoch(&mut loader).unwrap();
        // 10 images in batches of 4: three updates, G D G
        assert_eq!(report.record.n_updates, 3);
        assert_eq!(report.record.n_examples, 10);
        assert!(report.record.g_cost.is_some_and(f32::is_finite));
        assert!(report.record.d_cost.is_some_and(f32::is_finite));
        assert_eq!(report.samples.shape(), &[3, 3, 16, 16]);

        // epoch 1 == niter: rate unchanged until the next epoch
        assert_eq!(report.lr, 1e-4);
        let second = trainer.train_epoch(&mut loader).unwrap();
        assert!((second.lr - 0.5e-4).abs() < 1e-9);
        assert_eq!(trainer.learning_rates(), (Some(second.lr), Some(second.lr)));
        assert_eq!(second.record.n_updates, 6);
    }

    #[test]
    fn generator_step_leaves_the_discriminator_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = GanTrainer::new(tiny_config(dir.path())).unwrap();
        let d_before = trainer.discriminator().params().values();
        let g_before = trainer.generator().params().values();

        let (step, costs) = trainer.update(images(4).images().clone()).unwrap();
        assert_eq!(step, Step::Generator);
        assert_eq!(costs.len(), 5);
        assert_eq!(trainer.discriminator().params().values(), d_before);
        assert_ne!(trainer.generator().params().values(), g_before);

        let (step, _) = trainer.update(images(4).images().clone()).unwrap();
        assert_eq!(step, Step::Discriminator);
        assert_ne!(trainer.discriminator().params().values(), d_before);
    }

    #[test]
    fn malformed_batches_are_rejected_before_any_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = GanTrainer::new(tiny_config(dir.path())).unwrap();
        let g_before = trainer.generator().params().values();
        for shape in [&[][..], &[4, 768][..], &[4, 1, 16, 16][..], &[4, 3, 32, 32][..], &[0, 3, 16, 16][..]] {
            let err = trainer.update(ArrayD::zeros(IxDyn(shape))).unwrap_err();
            assert!(matches!(err, TrainError::DataMismatch { .. }), "{shape:?}");
        }
        assert_eq!(trainer.n_updates(), 0);
        assert_eq!(trainer.generator().params().values(), g_before);
    }

    #[test]
    fn mismatched_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = GanTrainer::new(tiny_config(dir.path())).unwrap();
        let wrong = ImageSet::from_array(ArrayD::zeros(IxDyn(&[2, 1, 16, 16])), 1, 16).unwrap();
        assert!(matches!(trainer.loader(wrong), Err(TrainError::DataMismatch { .. })));
    }
}
