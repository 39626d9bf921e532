use candle_core::{Device, Shape, Tensor};
use color_eyre::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

/// Standard-normal f32 tensor drawn on the host from a seeded generator, so the
/// values only depend on `seed` and not on the backend.
pub fn seeded_normal(seed: u64, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

pub fn fresh_seed() -> u64 {
    rand::random()
}
