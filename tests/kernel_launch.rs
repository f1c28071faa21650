use saber_rt::backend::{Precision, Target};
use saber_rt::kernel::{KernelInfo, create_kernel, launch_kernel, open_device, profiler, Stream};
use saber_rt::ops::{OpContext, factory};
use saber_rt::params::ParamStore;
use saber_rt::tensors::{Layout, Tensor};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_profiled_launches_are_timed() {
    init_logger();
    profiler::set_recording(true);
    let ctx = OpContext::new(Target::Host, 0).unwrap().with_sync(true);
    let mut op = factory::create("Resize", Precision::Fp32, Target::Host);
    op.init_param(
        &ParamStore::new("resize_0")
            .with("height_scale", 1.5f32)
            .with("width_scale", 1.5f32),
    );
    let x = [Tensor::from_vec([1, 2, 2, 2], Layout::Nchw, (0..8).map(|v| v as f32).collect())];
    let mut y = [Tensor::default()];
    op.infer_shape(&x, &mut y);
    assert_eq!(y[0].shape().dims(), &[1, 2, 3, 3]);
    op.init(&ctx, &x, &mut y).unwrap();
    op.forward(&ctx, &x, &mut y).unwrap();
    op.forward(&ctx, &x, &mut y).unwrap();
    profiler::set_recording(false);

    let stats = profiler::summary();
    let resize = stats
        .iter()
        .find(|s| s.kernel == "ker_resize_bilinear_fwd")
        .expect("resize launches were recorded");
    assert!(resize.launches >= 2);
    assert!(resize.timed >= 2);
    assert!(resize.total_ms >= 0.0);
}

#[test]
fn test_handles_share_programs_but_not_geometry() {
    let device = open_device(Target::Host, 0).unwrap();
    let small = KernelInfo::new("SoftSign", "ker_soft_sign_fwd").with_count(4);
    let large = small.clone().with_work(&[64], &[1000]);
    let a = create_kernel(&*device, &small).unwrap();
    let mut b = create_kernel(&*device, &large).unwrap();
    assert!(a.shares_program(&b));
    assert_eq!(b.info().g_wk, vec![1024]);

    let stream = Stream::new(device);
    let x = Tensor::from_vec([4], Layout::W, vec![-3.0, -1.0, 1.0, 3.0]);
    let y = Tensor::new([4], Layout::W);
    assert!(b.set_kernel_args(vec![(&y).into(), (&x).into(), 4i32.into()]));
    assert!(launch_kernel(&stream, &[b], true));
    assert_eq!(y.to_vec(), vec![-0.75, -0.5, 0.5, 0.75]);
}

#[test]
fn test_wgpu_context_without_feature_fails_cleanly() {
    if cfg!(feature = "wgpu") {
        return;
    }
    assert!(OpContext::new(Target::Wgpu, 0).is_err());
}
