use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use candle_gp::kernel::{KernelT, SpectralEstimator, SpectralFlowKernel, SpectralKernelConfig};
use candle_gp::{GpError, Result};
use candle_nn::{VarBuilder, VarMap};

fn kernel_with(config: SpectralKernelConfig) -> Result<(VarMap, SpectralFlowKernel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
    let kernel = SpectralFlowKernel::new(config, vb)?;
    Ok((varmap, kernel))
}

fn one_dim(seed: u64) -> SpectralKernelConfig {
    SpectralKernelConfig {
        seed,
        init_lengthscale: 1.0,
        ..SpectralKernelConfig::new(1, SpectralEstimator::Mean)
    }
}

#[test]
fn test_seeded_covariance_is_reproducible() -> Result<()> {
    let x = Tensor::new(&[[0.0f64], [1.0], [2.0]], &Device::Cpu)?;

    let (_va, a) = kernel_with(one_dim(42))?;
    let (_vb, b) = kernel_with(one_dim(42))?;
    let (_vc, c) = kernel_with(one_dim(7))?;

    let ka: Vec<Vec<f64>> = a.forward(&x, &x)?.to_vec2()?;
    let kb: Vec<Vec<f64>> = b.forward(&x, &x)?.to_vec2()?;
    let kc: Vec<Vec<f64>> = c.forward(&x, &x)?.to_vec2()?;

    assert_eq!(ka, kb);
    assert_ne!(ka, kc);
    for row in ka.iter().chain(kc.iter()) {
        for v in row {
            assert!((-1.0..=1.0).contains(v));
        }
    }
    for i in 0..3 {
        assert_eq!(ka[i][i], 1.0);
    }
    Ok(())
}

#[test]
fn test_trained_flow_keeps_kernel_properties() -> Result<()> {
    let config = SpectralKernelConfig {
        ard: true,
        stack_size: 2,
        num_samples: Some(500),
        ..SpectralKernelConfig::new(2, SpectralEstimator::Importance)
    };
    let (varmap, kernel) = kernel_with(config)?;

    // move every parameter so the flow is no longer the identity
    for (_, var) in varmap.data().lock().expect("varmap lock").iter() {
        let moved = (var.as_tensor() + 0.1)?;
        var.set(&moved)?;
    }

    let x = Tensor::new(&[[0.0f64, 0.0], [0.5, -0.3], [1.2, 0.4]], &Device::Cpu)?;
    let k: Vec<Vec<f64>> = kernel.forward(&x, &x)?.to_vec2()?;
    let diag: Vec<f64> = kernel.evaluate(&x, &x, true, false)?.to_vec1()?;
    for i in 0..3 {
        assert_abs_diff_eq!(k[i][i], diag[i], epsilon = 1e-10);
        for j in 0..3 {
            assert_abs_diff_eq!(k[i][j], k[j][i], epsilon = 1e-12);
            assert!(k[i][j].abs() <= 1.0 + 1e-12);
        }
    }
    Ok(())
}

#[test]
fn test_cross_covariance_shapes() -> Result<()> {
    let (_v, kernel) = kernel_with(SpectralKernelConfig {
        num_samples: Some(100),
        ..SpectralKernelConfig::new(3, SpectralEstimator::Mean)
    })?;
    let x1 = Tensor::zeros((2, 4, 3), DType::F64, &Device::Cpu)?;
    let x2 = Tensor::ones((2, 6, 3), DType::F64, &Device::Cpu)?;
    assert_eq!(kernel.forward(&x1, &x2)?.dims(), &[2, 4, 6]);
    assert!(matches!(
        kernel.evaluate(&x1, &x2, true, false),
        Err(GpError::ShapeMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_config_json_round_trip() -> Result<()> {
    let dir = tempfile::tempdir().map_err(|e| GpError::Config(e.to_string()))?;
    let path = dir.path().join("kernel.json");

    let config = SpectralKernelConfig {
        num_samples: Some(128),
        hidden_factors: vec![4],
        seed: 3,
        ..SpectralKernelConfig::new(2, SpectralEstimator::Importance)
    };
    config.to_json_file(&path)?;
    let loaded = SpectralKernelConfig::from_json_file(&path)?;

    assert_eq!(loaded.num_dims, 2);
    assert_eq!(loaded.num_samples(), 128);
    assert_eq!(loaded.hidden_factors, vec![4]);
    assert_eq!(loaded.estimator, SpectralEstimator::Importance);
    assert_eq!(loaded.seed, 3);

    // missing fields fall back to defaults
    let partial = dir.path().join("partial.json");
    std::fs::write(&partial, r#"{ "num_dims": 3, "estimator": "mean" }"#)
        .map_err(|e| GpError::Config(e.to_string()))?;
    let loaded = SpectralKernelConfig::from_json_file(&partial)?;
    assert_eq!(loaded.num_dims, 3);
    assert_eq!(loaded.num_samples(), 2000);

    let invalid = dir.path().join("invalid.json");
    std::fs::write(&invalid, r#"{ "init_lengthscale": -2.0 }"#)
        .map_err(|e| GpError::Config(e.to_string()))?;
    assert!(matches!(
        SpectralKernelConfig::from_json_file(&invalid),
        Err(GpError::Config(_))
    ));
    Ok(())
}
