use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use saber_rt::approx::approx_eq;
use saber_rt::backend::{Precision, Target};
use saber_rt::config::GemmPolicy;
use saber_rt::error::{DeviceError, SaberError};
use saber_rt::kernel::{Device, KernelInfo, Program, Stream};
use saber_rt::funcs::ImplKind;
use saber_rt::ops::{HelperState, OpContext, Operator, factory};
use saber_rt::params::ParamStore;
use saber_rt::tensors::{Layout, Tensor};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn host() -> OpContext {
    OpContext::new(Target::Host, 0).unwrap()
}

fn random(shape: &[usize], layout: Layout, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = shape.iter().product();
    let data = (0..count).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(shape, layout, data)
}

/// Runs the full lifecycle once and returns the output.
fn run(op: &mut Operator, ctx: &OpContext, store: &ParamStore, inputs: &[Tensor]) -> Tensor {
    let mut outputs = [Tensor::default()];
    op.init_param(store);
    op.infer_shape(inputs, &mut outputs);
    op.init(ctx, inputs, &mut outputs).unwrap();
    op.forward(ctx, inputs, &mut outputs).unwrap();
    let [out] = outputs;
    out
}

fn run_once(name: &str, store: &ParamStore, inputs: &[Tensor]) -> Tensor {
    let mut op = factory::create(name, Precision::Fp32, Target::Host);
    run(&mut op, &host(), store, inputs)
}

#[test]
fn test_data_norm_batch_statistics() {
    init_logger();
    let store = ParamStore::new("data_norm_0")
        .with("weight_1", Tensor::from_vec([1, 3, 1, 1], Layout::Nchw, vec![4.0, 8.0, 12.0]))
        .with("weight_2", Tensor::from_vec([1, 3, 1, 1], Layout::Nchw, vec![4.0, 4.0, 4.0]))
        .with("weight_3", Tensor::from_vec([1, 3, 1, 1], Layout::Nchw, vec![16.0, 16.0, 16.0]))
        .with("epsilon", 1e-4f32);
    let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let mut x = Tensor::from_vec([4, 3, 1, 1], Layout::Nchw, data.clone());
    x.set_seq_offset(vec![vec![0, 1, 4]]);

    let y = run_once("DataNorm", &store, std::slice::from_ref(&x));
    assert_eq!(y.shape().dims(), &[4, 3]);
    assert_eq!(y.layout(), Layout::Nc);
    assert_eq!(y.seq_offset(), x.seq_offset());
    // mean = [1, 2, 3], scale = sqrt(4 / 16) = 0.5
    let expected: Vec<f32> = data
        .iter()
        .enumerate()
        .map(|(i, v)| (v - [1.0, 2.0, 3.0][i % 3]) * 0.5)
        .collect();
    assert!(approx_eq(&y.to_vec()[..], &expected[..]));
}

#[test]
#[should_panic(expected = "DataNorm expects (N, C, 1, 1) input")]
fn test_data_norm_rejects_spatial_input() {
    let stats = Tensor::from_vec([1, 3, 1, 1], Layout::Nchw, vec![1.0; 3]);
    let store = ParamStore::new("data_norm_1")
        .with("weight_1", stats.clone())
        .with("weight_2", stats.clone())
        .with("weight_3", stats)
        .with("epsilon", 1e-4f32);
    run_once("DataNorm", &store, &[Tensor::new([2, 3, 2, 2], Layout::Nchw)]);
}

#[test]
#[should_panic(expected = "parameter `epsilon` of node `data_norm_2` is missing")]
fn test_data_norm_requires_epsilon() {
    let stats = Tensor::from_vec([1, 3, 1, 1], Layout::Nchw, vec![1.0; 3]);
    let store = ParamStore::new("data_norm_2")
        .with("weight_1", stats.clone())
        .with("weight_2", stats.clone())
        .with("weight_3", stats);
    factory::create("DataNorm", Precision::Fp32, Target::Host).init_param(&store);
}

#[test]
fn test_shuffle_channel_group_three() {
    let data: Vec<f32> = (0..9).flat_map(|c| (0..4).map(move |s| (c * 10 + s) as f32)).collect();
    let x = Tensor::from_vec([1, 9, 2, 2], Layout::Nchw, data);
    let y = run_once("ShuffleChannel", &ParamStore::new("sc").with("group", 3), &[x]);
    assert_eq!(y.shape().dims(), &[1, 9, 2, 2]);

    let out = y.to_vec();
    // input channel i * 3 + j lands on output channel j * 3 + i
    for i in 0..3 {
        for j in 0..3 {
            for s in 0..4 {
                assert_eq!(out[(j * 3 + i) * 4 + s], ((i * 3 + j) * 10 + s) as f32);
            }
        }
    }
}

fn pixel_shuffle_round_trip(shape: [usize; 4], factor: i32) {
    let x = random(&shape, Layout::Nchw, 11);
    let forward = ParamStore::new("ps").with("upscale_factor", factor);
    let inverse = forward.clone().with("inverse", true);

    let y = run_once("PixelShuffle", &forward, std::slice::from_ref(&x));
    let f = factor as usize;
    assert_eq!(
        y.shape().dims(),
        &[shape[0], shape[1] / (f * f), shape[2] * f, shape[3] * f]
    );
    let back = run_once("PixelShuffle", &inverse, &[y]);
    assert_eq!(back.shape().dims(), &shape);
    assert_eq!(back.to_vec(), x.to_vec());
}

#[test]
fn test_pixel_shuffle_round_trips() {
    pixel_shuffle_round_trip([1, 9, 2, 2], 3);
    pixel_shuffle_round_trip([1, 4, 4, 4], 2);
}

#[test]
fn test_pixel_shuffle_places_blocks() {
    // one output channel, factor 2: out[2h + i][2w + j] = in[2i + j][h][w]
    let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let x = Tensor::from_vec([1, 4, 2, 2], Layout::Nchw, data);
    let y = run_once("PixelShuffle", &ParamStore::new("ps").with("upscale_factor", 2), &[x]);
    let out = y.to_vec();
    for h in 0..2 {
        for w in 0..2 {
            for i in 0..2 {
                for j in 0..2 {
                    let src = ((i * 2 + j) * 4 + h * 2 + w) as f32;
                    assert_eq!(out[(h * 2 + i) * 4 + w * 2 + j], src);
                }
            }
        }
    }
}

#[test]
fn test_reshape_keeps_offsets_and_data() {
    let mut x = random(&[2, 3, 4, 5], Layout::Nchw, 3);
    x.set_seq_offset(vec![vec![0, 2], vec![0, 1, 2]]);
    let store = ParamStore::new("reshape_0")
        .with("dims", vec![0, -1, 5])
        .with("layout", "NHW");
    let y = run_once("reshape", &store, std::slice::from_ref(&x));
    assert_eq!(y.shape().dims(), &[2, 12, 5]);
    assert_eq!(y.layout(), Layout::Nhw);
    assert_eq!(y.seq_offset(), x.seq_offset());
    assert_eq!(y.to_vec(), x.to_vec());
}

#[test]
#[should_panic(expected = "The layout is required when the shape is not equal to 4")]
fn test_reshape_needs_layout_off_rank_four() {
    let store = ParamStore::new("reshape_1").with("dims", vec![6, 4]);
    run_once("Reshape", &store, &[Tensor::new([2, 3, 4, 1], Layout::Nchw)]);
}

#[test]
fn test_sequence_pool_reduces_sequences() {
    let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let mut x = Tensor::from_vec([6, 2], Layout::Nc, data);
    x.set_seq_offset(vec![vec![0, 2, 3, 6]]);

    let sum = run_once("SequencePool", &ParamStore::new("sp").with("pooltype", "SUM"), std::slice::from_ref(&x));
    assert_eq!(sum.shape().dims(), &[3, 2]);
    assert_eq!(sum.seq_offset(), &[vec![0, 1, 2, 3]]);
    // rows [0,1] [2,3] | [4,5] | [6,7] [8,9] [10,11]
    assert_eq!(sum.to_vec(), vec![2.0, 4.0, 4.0, 5.0, 24.0, 27.0]);

    let last = run_once("SequencePool", &ParamStore::new("sp").with("pooltype", "LAST"), std::slice::from_ref(&x));
    assert_eq!(last.to_vec(), vec![2.0, 3.0, 4.0, 5.0, 10.0, 11.0]);

    let avg = run_once("SequencePool", &ParamStore::new("sp").with("pooltype", "AVERAGE"), &[x]);
    assert_eq!(avg.to_vec(), vec![1.0, 2.0, 4.0, 5.0, 8.0, 9.0]);
}

#[test]
#[should_panic(expected = "unknown pooltype `MEDIAN`")]
fn test_sequence_pool_rejects_unknown_type() {
    let mut op = factory::create("SequencePool", Precision::Fp32, Target::Host);
    op.init_param(&ParamStore::new("sp").with("pooltype", "MEDIAN"));
}

#[test]
fn test_sequence_pool_concat_joins_slots() {
    let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let mut x = Tensor::from_vec([6, 2], Layout::Nc, data);
    x.set_seq_offset(vec![vec![0, 2, 3, 4, 6]]);
    let store = ParamStore::new("spc").with("pooltype", "SUM").with("slot_num", 2);
    let y = run_once("sequence_pool_concat", &store, &[x]);
    assert_eq!(y.shape().dims(), &[2, 4]);
    assert_eq!(y.layout(), Layout::Nc);
    assert_eq!(y.seq_offset(), &[vec![0, 1, 2]]);
    // sequences [2,4] [4,5] | [6,7] [18,20]
    assert_eq!(y.to_vec(), vec![2.0, 4.0, 4.0, 5.0, 6.0, 7.0, 18.0, 20.0]);
}

#[test]
#[should_panic(expected = "invalid parameters for SequencePoolConcat")]
fn test_sequence_pool_concat_rejects_zero_slots() {
    let mut op = factory::create("SequencePoolConcat", Precision::Fp32, Target::Host);
    op.init_param(&ParamStore::new("spc").with("slot_num", 0));
}

#[test]
fn test_mat_mul_shares_y_across_planes() {
    init_logger();
    let x = Tensor::from_vec([1, 2, 2, 3], Layout::Nchw, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    let y = Tensor::from_vec([1, 1, 3, 2], Layout::Nchw, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let store = ParamStore::new("mm")
        .with("transpose_x", false)
        .with("transpose_y", false)
        .with("coeff", 2.0f32);
    let out = run_once("MatMul", &store, &[x, y]);
    assert_eq!(out.shape().dims(), &[1, 2, 2, 2]);
    assert_eq!(out.to_vec(), vec![8.0, 10.0, 20.0, 22.0, 0.0, 2.0, 4.0, 2.0]);
}

#[test]
fn test_mat_mul_transposed_operands() {
    let (batch, m, n, k) = (2, 2, 2, 3);
    // X stored K x M, Y stored N x K
    let x = random(&[1, batch, k, m], Layout::Nchw, 21);
    let y = random(&[1, batch, n, k], Layout::Nchw, 22);
    let store = ParamStore::new("mm_t")
        .with("transpose_x", true)
        .with("transpose_y", true);
    let out = run_once("mat_mul", &store, &[x.clone(), y.clone()]);
    assert_eq!(out.shape().dims(), &[1, batch, m, n]);

    let (xv, yv) = (x.to_vec(), y.to_vec());
    let mut expected = vec![0.0f32; batch * m * n];
    for b in 0..batch {
        for i in 0..m {
            for j in 0..n {
                expected[(b * m + i) * n + j] = (0..k)
                    .map(|p| xv[(b * k + p) * m + i] * yv[(b * n + j) * k + p])
                    .sum();
            }
        }
    }
    assert!(approx_eq(&out.to_vec()[..], &expected[..]));
}

#[test]
fn test_power_soft_sign_cos_sim_resize() {
    let x = Tensor::from_vec([1, 1, 2, 2], Layout::Nchw, vec![0.0, 1.0, 2.0, 3.0]);
    let power = ParamStore::new("pow")
        .with("scale", 2.0f32)
        .with("shift", 1.0f32)
        .with("power", 2.0f32);
    let pow = run_once("Power", &power, std::slice::from_ref(&x));
    assert!(approx_eq(&pow.to_vec()[..], &[1.0f32, 9.0, 25.0, 49.0][..]));

    let soft = run_once("SoftSign", &ParamStore::new("ss"), std::slice::from_ref(&x));
    assert!(approx_eq(&soft.to_vec()[..], &[0.0f32, 0.5, 2.0 / 3.0, 0.75][..]));

    let a = Tensor::from_vec([2, 2, 1, 1], Layout::Nchw, vec![1.0, 0.0, 3.0, 4.0]);
    let b = Tensor::from_vec([2, 2, 1, 1], Layout::Nchw, vec![0.0, 2.0, 3.0, 4.0]);
    let cos = run_once("CosSim", &ParamStore::new("cos").with("epsilon", 1e-6f32), &[a, b]);
    assert_eq!(cos.shape().dims(), &[2, 1, 1, 1]);
    assert!(approx_eq(&cos.to_vec()[..], &[0.0f32, 1.0][..]));

    let resize = ParamStore::new("rs")
        .with("height_scale", 2.0f32)
        .with("width_scale", 2.0f32);
    let up = run_once("Resize", &resize, &[x]);
    assert_eq!(up.shape().dims(), &[1, 1, 4, 4]);
    let out = up.to_vec();
    assert_eq!(out[0], 0.0);
    assert_eq!(out[1], 0.5);
    assert_eq!(out[15], 3.0);
}

fn conv_store(weight: &Tensor, bias: Option<&Tensor>, kernel: i32, stride: i32, pad: i32) -> ParamStore {
    let filters = weight.num() as i32;
    let mut store = ParamStore::new("conv_relu_pool_0")
        .with("group", 1)
        .with("bias_term", bias.is_some())
        .with("padding", vec![pad, pad])
        .with("strides", vec![stride, stride])
        .with("dilation_rate", vec![1, 1])
        .with("filter_num", filters)
        .with("kernel_size", vec![kernel, kernel])
        .with("axis", 1)
        .with("weight_1", weight.clone())
        .with("relu_0_alpha", 0.1f32)
        .with("pooling_0_global_pooling", false)
        .with("pooling_0_padding", vec![0, 0])
        .with("pooling_0_strides", vec![2, 2])
        .with("pooling_0_pool_size", vec![2, 2])
        .with("pooling_0_method", "MAX")
        .with("pooling_0_cmp_out_shape_floor_as_conv", true);
    if let Some(bias) = bias {
        store.set("weight_2", bias.clone());
    }
    store
}

/// Straight loops over OIHW weights: conv, bias, leaky relu (0.1), 2x2/2 max pool.
fn reference_conv_relu_pool(x: &Tensor, w: &[f32], bias: &[f32], k: usize, stride: usize, pad: usize) -> Vec<f32> {
    let (n, c, h, wd) = (x.num(), x.channel(), x.height(), x.width());
    let oc = bias.len();
    let oh = (h + 2 * pad - k) / stride + 1;
    let ow = (wd + 2 * pad - k) / stride + 1;
    let xs = x.to_vec();
    let mut conv = vec![0.0f32; n * oc * oh * ow];
    for b in 0..n {
        for o in 0..oc {
            for y in 0..oh {
                for z in 0..ow {
                    let mut acc = bias[o];
                    for ci in 0..c {
                        for ky in 0..k {
                            for kx in 0..k {
                                let iy = (y * stride + ky) as isize - pad as isize;
                                let ix = (z * stride + kx) as isize - pad as isize;
                                if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= wd {
                                    continue;
                                }
                                acc += xs[((b * c + ci) * h + iy as usize) * wd + ix as usize]
                                    * w[((o * c + ci) * k + ky) * k + kx];
                            }
                        }
                    }
                    conv[((b * oc + o) * oh + y) * ow + z] = if acc > 0.0 { acc } else { 0.1 * acc };
                }
            }
        }
    }
    let (ph, pw) = ((oh - 2) / 2 + 1, (ow - 2) / 2 + 1);
    let mut out = vec![0.0f32; n * oc * ph * pw];
    for plane in 0..n * oc {
        for y in 0..ph {
            for z in 0..pw {
                let mut m = f32::NEG_INFINITY;
                for dy in 0..2 {
                    for dx in 0..2 {
                        m = m.max(conv[(plane * oh + y * 2 + dy) * ow + z * 2 + dx]);
                    }
                }
                out[(plane * ph + y) * pw + z] = m;
            }
        }
    }
    out
}

#[test]
fn test_conv_relu_pool_paths_agree() {
    init_logger();
    // 1x1, batch 2, width 8: eligible for the GEMM chain by default
    let x = random(&[2, 3, 8, 8], Layout::Nchw, 5);
    let weight = random(&[4, 3, 1, 1], Layout::Nchw, 6);
    let bias = random(&[4], Layout::W, 7);
    let expected = reference_conv_relu_pool(&x, &weight.to_vec(), &bias.to_vec(), 1, 1, 0);
    let store = conv_store(&weight, Some(&bias), 1, 1, 0);

    let direct_only = GemmPolicy {
        min_batch: usize::MAX,
        stride_two: false,
        ..GemmPolicy::default()
    };
    let contexts = [
        host(),
        host().with_gemm_policy(direct_only),
        host().with_impl(ImplKind::Vender),
    ];
    for ctx in &contexts {
        let mut op = factory::create("ConvReluPool", Precision::Fp32, Target::Host);
        let y = run(&mut op, ctx, &store, std::slice::from_ref(&x));
        assert_eq!(y.shape().dims(), &[2, 4, 4, 4]);
        assert!(approx_eq(&y.to_vec()[..], &expected[..]), "{:?}", ctx);
    }
}

#[test]
fn test_conv_relu_pool_three_by_three() {
    let x = random(&[1, 2, 6, 6], Layout::Nchw, 21);
    let weight = random(&[3, 2, 3, 3], Layout::Nchw, 22);
    let original = weight.to_vec();
    let expected = reference_conv_relu_pool(&x, &original, &[0.0; 3], 3, 1, 1);
    let store = conv_store(&weight, None, 3, 1, 1);

    for ctx in [host(), host().with_impl(ImplKind::Vender)] {
        let mut op = factory::create("convolution_relu_pooling", Precision::Fp32, Target::Host);
        let y = run(&mut op, &ctx, &store, std::slice::from_ref(&x));
        assert_eq!(y.shape().dims(), &[1, 3, 3, 3]);
        assert!(approx_eq(&y.to_vec()[..], &expected[..]));
    }
}

#[test]
fn test_weight_transform_runs_once_across_helpers() {
    // one filter, two channels, 1x2 kernel: OIHW [1, 2, 3, 4] is OHWI [1, 3, 2, 4]
    let weight = Tensor::from_vec([1, 2, 1, 2], Layout::Nchw, vec![1.0, 2.0, 3.0, 4.0]);
    let mut store = conv_store(&weight, None, 1, 1, 0);
    store.set("kernel_size", vec![1, 2]);
    store.set("pooling_0_global_pooling", true);
    let x = random(&[1, 2, 3, 4], Layout::Nchw, 9);

    let ctx = host();
    let mut a = factory::create("ConvReluPool", Precision::Fp32, Target::Host);
    let mut b = factory::create("ConvReluPool", Precision::Fp32, Target::Host);
    let first = run(&mut a, &ctx, &store, std::slice::from_ref(&x));
    let second = run(&mut b, &ctx, &store, std::slice::from_ref(&x));
    let mut outputs = [Tensor::default()];
    for op in [&mut a, &mut b] {
        for _ in 0..3 {
            op.infer_shape(std::slice::from_ref(&x), &mut outputs);
            op.init(&ctx, std::slice::from_ref(&x), &mut outputs).unwrap();
        }
    }

    assert!(weight.buffer().is_transformed());
    assert_eq!(weight.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(first.to_vec(), second.to_vec());
    a.forward(&ctx, std::slice::from_ref(&x), &mut outputs).unwrap();
    assert_eq!(outputs[0].to_vec(), first.to_vec());
}

#[test]
fn test_dispatch_is_deterministic() {
    let ctx = host();
    let x = [random(&[2, 8, 3, 3], Layout::Nchw, 42)];
    let mut op = factory::create("ShuffleChannel", Precision::Fp32, Target::Host);
    let first = run(&mut op, &ctx, &ParamStore::new("sc").with("group", 4), &x);
    for _ in 0..5 {
        let mut out = [Tensor::default()];
        op.infer_shape(&x, &mut out);
        assert_eq!(op.state(), HelperState::Initialized);
        op.forward(&ctx, &x, &mut out).unwrap();
        assert_eq!(out[0].to_vec(), first.to_vec());
    }
}

#[test]
fn test_infer_shape_is_pure() {
    let mut x = random(&[6, 4], Layout::Nc, 1);
    x.set_seq_offset(vec![vec![0, 3, 6]]);
    let before = x.to_vec();
    let mut op = factory::create("SequencePool", Precision::Fp32, Target::Host);
    op.init_param(&ParamStore::new("sp").with("pooltype", "MAX"));

    let mut first = [Tensor::default()];
    let mut second = [Tensor::default()];
    op.infer_shape(std::slice::from_ref(&x), &mut first);
    op.infer_shape(std::slice::from_ref(&x), &mut second);
    assert_eq!(first[0].shape(), second[0].shape());
    assert_eq!(first[0].layout(), second[0].layout());
    assert_eq!(first[0].seq_offset(), second[0].seq_offset());
    assert_eq!(x.to_vec(), before);
    assert_eq!(x.seq_offset(), &[vec![0, 3, 6]]);
}

#[test]
fn test_missing_parameter_is_fatal() {
    let result = std::panic::catch_unwind(|| {
        let mut op = factory::create("Power", Precision::Fp32, Target::Host);
        op.init_param(&ParamStore::new("pow").with("scale", 1.0f32));
    });
    assert!(result.is_err());
}

/// A host device whose compiler rejects every program.
struct BrokenCompiler;

impl Device for BrokenCompiler {
    fn target(&self) -> Target {
        Target::Host
    }

    fn id(&self) -> usize {
        4242
    }

    fn build(&self, info: &KernelInfo) -> Result<Arc<dyn Program>, DeviceError> {
        Err(DeviceError::Compile {
            kernel: info.kernel_name.clone(),
            reason: "compiler offline".into(),
        })
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[test]
fn test_init_reports_kernel_create_failure() {
    init_logger();
    let ctx = OpContext::from_stream(Stream::new(Arc::new(BrokenCompiler)));
    let x = random(&[4], Layout::W, 11);
    let mut out = [Tensor::default()];
    let mut op = factory::create("SoftSign", Precision::Fp32, Target::Host);
    op.init_param(&ParamStore::new("ss_broken"));
    op.infer_shape(std::slice::from_ref(&x), &mut out);
    let err = op.init(&ctx, std::slice::from_ref(&x), &mut out).unwrap_err();
    assert!(matches!(err, SaberError::KernelCreate { op: "SoftSign", .. }), "{err}");
}

#[test]
fn test_forward_reports_launch_failure_on_int_input() {
    init_logger();
    let ctx = host();
    let x = Tensor::from_ints([4], Layout::W, vec![1, -2, 3, -4]);
    let mut out = [Tensor::default()];
    let mut op = factory::create("SoftSign", Precision::Fp32, Target::Host);
    op.init_param(&ParamStore::new("ss_int"));
    op.infer_shape(std::slice::from_ref(&x), &mut out);
    op.init(&ctx, std::slice::from_ref(&x), &mut out).unwrap();
    let err = op.forward(&ctx, std::slice::from_ref(&x), &mut out).unwrap_err();
    assert!(matches!(err, SaberError::Launch { .. }), "{err}");
}
