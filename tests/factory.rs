use saber_rt::backend::{Precision, Target};
use saber_rt::ops::{HelperState, factory};

const ALL_OPS: [&str; 12] = [
    "ConvReluPool",
    "CosSim",
    "DataNorm",
    "MatMul",
    "PixelShuffle",
    "Power",
    "Reshape",
    "Resize",
    "SequencePool",
    "SequencePoolConcat",
    "ShuffleChannel",
    "SoftSign",
];

#[test]
fn test_registered_ops_are_sorted_and_complete() {
    assert_eq!(factory::registered_ops(), ALL_OPS.to_vec());
}

#[test]
fn test_unknown_operator_is_fatal() {
    let result = std::panic::catch_unwind(|| factory::create("NoSuchOp", Precision::Fp32, Target::Host));
    let err = result.unwrap_err();
    let msg = err.downcast_ref::<String>().cloned().unwrap_or_default();
    assert!(msg.contains("opname: NoSuchOp"), "{msg}");
}

#[test]
fn test_unsupported_precision_is_fatal() {
    for op in ALL_OPS {
        assert!(std::panic::catch_unwind(|| factory::create(op, Precision::Int8, Target::Host)).is_err());
    }
}

#[cfg(not(feature = "wgpu"))]
#[test]
fn test_wgpu_needs_the_feature() {
    for op in ALL_OPS {
        assert!(!factory::is_supported(op, Precision::Fp32, Target::Wgpu), "{op}");
    }
}

#[cfg(feature = "wgpu")]
#[test]
fn test_wgpu_covers_shader_ops() {
    for op in ["DataNorm", "PixelShuffle", "Power", "Reshape", "ShuffleChannel", "SoftSign"] {
        assert!(factory::is_supported(op, Precision::Fp32, Target::Wgpu), "{op}");
    }
    assert!(!factory::is_supported("ConvReluPool", Precision::Fp32, Target::Wgpu));
}

#[test]
fn test_aliases_create_the_canonical_operator() {
    for (alias, name) in [
        ("soft_sign", "SoftSign"),
        ("softsign", "SoftSign"),
        ("ConvolutionReluPooling", "ConvReluPool"),
        ("shuffle_channel", "ShuffleChannel"),
        ("matmul", "MatMul"),
        ("sequence_pool_concat", "SequencePoolConcat"),
    ] {
        let op = factory::create(alias, Precision::Fp32, Target::Host);
        assert_eq!(op.name(), name);
        assert_eq!(op.state(), HelperState::Unparsed);
    }
}

#[test]
fn test_schemas_describe_arguments() {
    let cos = factory::schema("CosSim").unwrap();
    assert_eq!((cos.num_in, cos.num_out), (2, 1));

    let shuffle = factory::schema("shuffle_channel").unwrap();
    assert_eq!(shuffle.name, "ShuffleChannel");
    assert_eq!(shuffle.args, &["group"]);

    let conv = factory::schema("ConvReluPool").unwrap();
    assert!(conv.args.contains(&"pooling_0_method"));
    assert!(!conv.doc.is_empty());

    let mat_mul = factory::schema("mat_mul").unwrap();
    assert_eq!((mat_mul.num_in, mat_mul.num_out), (2, 1));
    assert_eq!(factory::schema("SequencePoolConcat").unwrap().args, &["pooltype", "slot_num"]);
}

#[test]
fn test_create_from_strings() {
    let op = factory::create_from_str("power", "fp32", "host");
    assert_eq!(op.name(), "Power");
    assert_eq!(op.target(), Target::Host);
    assert_eq!(op.precision(), Precision::Fp32);

    assert!(std::panic::catch_unwind(|| factory::create_from_str("Power", "fp64", "host")).is_err());
    assert!(std::panic::catch_unwind(|| factory::create_from_str("Power", "fp32", "tpu")).is_err());
}
