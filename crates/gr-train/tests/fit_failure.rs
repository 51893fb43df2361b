use gr_runtime::RuntimeError;
use gr_tensor::{
    Backend, BufferId, BufferType, CpuBackend, DType, Launch, OpKind, Result, TensorError,
};
use gr_train::{BackendRegression, DataLoader, FitConfig, LossKind, OptimizerConfig, TrainError};

/// CPU backend whose `execute` starts failing after a number of calls.
#[derive(Debug)]
struct FlakyBackend {
    inner: CpuBackend,
    remaining: usize,
}

impl FlakyBackend {
    fn new(successful_runs: usize) -> Self {
        FlakyBackend {
            inner: CpuBackend::new(),
            remaining: successful_runs,
        }
    }
}

impl Backend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    fn buffer_type(&self) -> BufferType {
        self.inner.buffer_type()
    }

    fn supports(&self, op: OpKind, dtype: DType) -> bool {
        self.inner.supports(op, dtype)
    }

    fn alloc_buffer(&mut self, size: usize) -> Result<BufferId> {
        self.inner.alloc_buffer(size)
    }

    fn free_buffer(&mut self, buffer: BufferId) {
        self.inner.free_buffer(buffer)
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<usize> {
        self.inner.buffer_size(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, bytes: &[u8]) -> Result<()> {
        self.inner.write_buffer(buffer, offset, bytes)
    }

    fn read_buffer(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.inner.read_buffer(buffer, offset, len)
    }

    fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes()
    }

    fn execute(&mut self, launches: &[Launch]) -> Result<()> {
        if self.remaining == 0 {
            return Err(TensorError::Execution {
                op: launches.first().map_or(OpKind::Add, |l| l.op),
                reason: "device lost".to_string(),
            });
        }
        self.remaining -= 1;
        self.inner.execute(launches)
    }
}

fn sgd_config() -> FitConfig {
    FitConfig {
        epochs: 1,
        batch_size: 1,
        shuffle: false,
        optimizer: OptimizerConfig::sgd(0.1),
        ..Default::default()
    }
}

#[test]
fn test_failed_fit_keeps_earlier_updates() {
    let xs = [0.5f32, 1.0, 0.25, 0.75, 0.1];
    let ys: Vec<f32> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
    let loader = DataLoader::new(DType::F32, 1, 1, 1);

    // three rows succeed, the fourth compute fails
    let (mut flaky, _) = BackendRegression::new(vec![Box::new(FlakyBackend::new(3))]).unwrap();
    let data = loader.load(&xs, &ys).unwrap();
    match flaky.train(&data, &sgd_config()) {
        Err(TrainError::Runtime(RuntimeError::Tensor(TensorError::Execution { reason, .. }))) => {
            assert_eq!(reason, "device lost")
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // the same three rows on a healthy backend
    let (mut healthy, _) = BackendRegression::new(vec![Box::new(CpuBackend::new())]).unwrap();
    let prefix = loader.load(&xs[..3], &ys[..3]).unwrap();
    healthy.train(&prefix, &sgd_config()).unwrap();

    let kept = flaky.params().unwrap();
    assert_ne!(kept, (0.0, 0.0));
    assert_eq!(kept, healthy.params().unwrap());
}

#[test]
fn test_validation_rows_are_never_shuffled() {
    // With a Mean loss on y = a*x + b the validation loss is exactly the
    // model output averaged over the held-out rows, whatever the seed.
    let xs: Vec<f64> = (0..20).map(|i| i as f64).collect();
    let ys = vec![0.0f64; 20];
    let held_out_mean_x = (16..20).map(|i| i as f64).sum::<f64>() / 4.0;

    for seed in [1, 2, 3] {
        let (mut model, _) = BackendRegression::new(vec![Box::new(CpuBackend::new())]).unwrap();
        model.set_params(1.0, 0.0).unwrap();
        let data = DataLoader::new(DType::F32, 1, 1, 1)
            .load(
                &xs.iter().map(|&v| v as f32).collect::<Vec<_>>(),
                &ys.iter().map(|&v| v as f32).collect::<Vec<_>>(),
            )
            .unwrap();
        let config = FitConfig {
            loss: LossKind::Mean,
            validation_fraction: 0.2,
            seed,
            ..Default::default()
        };
        let report = model.train(&data, &config).unwrap();
        let (a, b) = model.params().unwrap();
        let expected = a as f64 * held_out_mean_x + b as f64;
        let val = report.epochs[0].val_loss.unwrap();
        assert!((val - expected).abs() < 1e-3, "seed {seed}: {val} vs {expected}");
    }
}
