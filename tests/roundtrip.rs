use quanto_resolver::{
    apply, from_pretrained, from_single_file, save_pretrained, should_quantize, DenseTensor,
    FloatDtype, LoadOptions, Parameter, ParameterTree, QuantizationConfig, QuantizedModel,
    QuantoError, WeightPrecision, CONFIG_FILE, WEIGHTS_FILE,
};
use std::path::Path;

const MODULES: [&str; 4] = [
    "x_embedder",
    "transformer_blocks.0.attn.to_q",
    "transformer_blocks.0.ff.net",
    "proj_out",
];

fn values(n: usize, seed: usize) -> Vec<f32> {
    (0..n).map(|i| (((i + seed * 31) % 97) as f32 - 48.0) / 64.0).collect()
}

fn tiny_flux(dtype: FloatDtype) -> ParameterTree {
    let mut tree = ParameterTree::new();
    for (seed, module) in MODULES.iter().enumerate() {
        let w = DenseTensor::from_f32(&values(8 * 256, seed), vec![8, 256], dtype).unwrap();
        tree.insert_dense(format!("{module}.weight"), w);
        let b = DenseTensor::from_f32(&values(8, seed + 7), vec![8], dtype).unwrap();
        tree.insert_dense(format!("{module}.bias"), b);
    }
    let norm = DenseTensor::from_f32(&[1.0; 256], vec![256], dtype).unwrap();
    tree.insert_dense("norm_out.norm.weight", norm);
    tree
}

fn write_dense(dir: &Path, tree: &ParameterTree) {
    quanto_resolver::core::io::write_checkpoint(&dir.join(WEIGHTS_FILE), tree, None).unwrap();
}

fn load(dir: &Path, config: &QuantizationConfig) -> quanto_resolver::Result<QuantizedModel> {
    from_pretrained(dir, Some(config), LoadOptions::default())
}

#[test]
fn validate_accepts_supported_and_rejects_others() {
    for weights in ["float8", "int8", "int4", "int2"] {
        assert!(QuantizationConfig::new(weights).validate().is_ok());
    }
    let err = QuantizationConfig::new("int16").validate().unwrap_err();
    assert!(matches!(err, QuantoError::Config { field: "weights", .. }));
}

#[test]
fn exclusion_only_affects_named_module() {
    let tree = tiny_flux(FloatDtype::F32);
    let config = QuantizationConfig::new("int8")
        .with_modules_to_not_convert(["proj_out"])
        .validate()
        .unwrap();
    assert!(!should_quantize(&config, "proj_out"));
    for module in tree.modules() {
        if module != "proj_out" {
            assert!(should_quantize(&config, module), "{module}");
        }
    }

    let before = tree.get("proj_out.weight").cloned().unwrap();
    let (out, _) = apply(&config, tree).unwrap();
    assert_eq!(out.get("proj_out.weight"), Some(&before));
}

#[test]
fn save_and_reload_preserves_quantization_status() {
    let src = tempfile::tempdir().unwrap();
    write_dense(src.path(), &tiny_flux(FloatDtype::BF16));

    let cases = [
        ("float8", Some("float8")),
        ("int8", Some("int8")),
        ("int4", None),
        ("int2", None),
    ];
    for (weights, activations) in cases {
        let mut config =
            QuantizationConfig::new(weights).with_modules_to_not_convert(["proj_out"]);
        config.activations = activations.map(str::to_string);

        let model = load(src.path(), &config).unwrap();
        let out = tempfile::tempdir().unwrap();
        save_pretrained(&model, out.path()).unwrap();
        assert!(out.path().join(CONFIG_FILE).is_file());

        let reloaded = from_pretrained(out.path(), None, LoadOptions::default()).unwrap();
        assert_eq!(reloaded.config(), model.config());
        let expected: WeightPrecision = weights.parse().unwrap();
        for module in MODULES {
            assert_eq!(
                reloaded.is_quantized(module),
                model.is_quantized(module),
                "{weights} {module}"
            );
            assert_eq!(reloaded.module_precision(module), model.module_precision(module));
            assert_eq!(reloaded.activation_precision(module), model.activation_precision(module));
        }
        assert!(!reloaded.is_quantized("proj_out"));
        assert_eq!(reloaded.module_precision("x_embedder"), Some(expected));

        // identical packed weights give identical outputs
        let input = values(2 * 256, 3);
        let a = model.linear("transformer_blocks.0.ff.net", &input, 2).unwrap();
        let b = reloaded.linear("transformer_blocks.0.ff.net", &input, 2).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn config_is_restored_when_every_module_was_excluded() {
    let src = tempfile::tempdir().unwrap();
    let mut tree = ParameterTree::new();
    let w = DenseTensor::from_f32(&values(2 * 32, 0), vec![2, 32], FloatDtype::F32).unwrap();
    tree.insert_dense("proj_out.weight", w);
    write_dense(src.path(), &tree);

    let config = QuantizationConfig::new("int8").with_modules_to_not_convert(["proj_out"]);
    let model = load(src.path(), &config).unwrap();
    assert!(!model.has_quantized_modules());

    let out = tempfile::tempdir().unwrap();
    save_pretrained(&model, out.path()).unwrap();
    let reloaded = from_pretrained(out.path(), None, LoadOptions::default()).unwrap();
    let restored = reloaded.config().unwrap();
    assert_eq!(restored.weight_precision, WeightPrecision::Int8);
    assert!(restored.excluded_module_names.contains("proj_out"));
    assert_eq!(reloaded.config(), model.config());
}

#[test]
fn weights_only_config_leaves_activation_path_unmodified() {
    let src = tempfile::tempdir().unwrap();
    write_dense(src.path(), &tiny_flux(FloatDtype::F32));
    let model = load(src.path(), &QuantizationConfig::new("int8")).unwrap();
    let module = "transformer_blocks.0.attn.to_q";
    assert!(model.is_quantized(module));
    assert_eq!(model.activation_precision(module), None);

    // with no activation quantization the forward pass equals a dense
    // matmul against the dequantized weight on the raw input
    let input: Vec<f32> = (0..256).map(|i| 0.001 * i as f32 + 1e-4).collect();
    let w = model.weight_f32(module).unwrap();
    let y = model.linear(module, &input, 1).unwrap();
    let bias = model
        .tree()
        .get("transformer_blocks.0.attn.to_q.bias")
        .and_then(Parameter::as_dense)
        .unwrap()
        .to_f32_vec()
        .unwrap();
    for (o, row) in w.chunks_exact(256).enumerate() {
        let dot: f32 = row.iter().zip(&input).map(|(a, b)| a * b).sum();
        assert_eq!(y[o], dot + bias[o]);
    }

    let with_acts = load(
        src.path(),
        &QuantizationConfig::new("int8").with_activations("int8"),
    )
    .unwrap();
    let y_q = with_acts.linear(module, &input, 1).unwrap();
    assert_ne!(y, y_q);
}

#[test]
fn quantized_model_is_smaller_and_refuses_casts() {
    let file = tempfile::tempdir().unwrap();
    let dense = tiny_flux(FloatDtype::F32);
    let dense_bytes = dense.size_in_bytes();
    write_dense(file.path(), &dense);

    let mut model = from_single_file(
        &file.path().join(WEIGHTS_FILE),
        Some(&QuantizationConfig::new("int4")),
        LoadOptions::default(),
    )
    .unwrap();
    assert!(model.memory_footprint() < dense_bytes / 4);

    assert!(matches!(model.to_dtype(FloatDtype::F16), Err(QuantoError::QuantizedCast(_))));
    assert!(model.to_dtype(FloatDtype::F32).is_ok());
}

#[test]
fn keep_in_fp32_modules_survive_reload_in_fp32() {
    let src = tempfile::tempdir().unwrap();
    write_dense(src.path(), &tiny_flux(FloatDtype::F32));
    let options = LoadOptions::default()
        .with_dtype(FloatDtype::BF16)
        .with_keep_in_fp32_modules(["proj_out"]);
    let config = QuantizationConfig::new("float8");
    let model = from_pretrained(src.path(), Some(&config), options.clone()).unwrap();
    assert!(!model.is_quantized("proj_out"));

    let out = tempfile::tempdir().unwrap();
    save_pretrained(&model, out.path()).unwrap();
    let reloaded = from_pretrained(out.path(), None, options).unwrap();
    let proj = reloaded.tree().weight("proj_out").and_then(Parameter::as_dense).unwrap();
    assert_eq!(proj.float_dtype(), Some(FloatDtype::F32));
    let bias = reloaded.tree().get("x_embedder.bias").and_then(Parameter::as_dense).unwrap();
    assert_eq!(bias.float_dtype(), Some(FloatDtype::BF16));
}

#[test]
fn failed_conversion_yields_no_model() {
    let src = tempfile::tempdir().unwrap();
    let mut tree = tiny_flux(FloatDtype::F32);
    tree.insert_dense(
        "context_embedder.weight",
        DenseTensor::from_f32(&values(4 * 40, 1), vec![4, 40], FloatDtype::F32).unwrap(),
    );
    write_dense(src.path(), &tree);
    let err = load(src.path(), &QuantizationConfig::new("int8")).unwrap_err();
    assert!(matches!(err, QuantoError::Conversion { .. }));

    // the same checkpoint loads once the odd module is excluded
    let config =
        QuantizationConfig::new("int8").with_modules_to_not_convert(["context_embedder"]);
    assert!(load(src.path(), &config).is_ok());
}

#[test]
fn invalid_config_fails_before_reading_checkpoint() {
    let missing = Path::new("/definitely/not/here");
    let err = load(missing, &QuantizationConfig::new("int3")).unwrap_err();
    assert!(matches!(err, QuantoError::Config { .. }));
    let err = from_pretrained(missing, None, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, QuantoError::Checkpoint(_)));
}
