use std::sync::Arc;

use anyhow::Result;
use shapejit::backend::spec::{DType, PadDim, Shape};
use shapejit::ops::graph::{mkconditional, mkwhile, Body, ComputationBuilder, Op, Padding};
use shapejit::tensor::Tensor;
use shapejit::Computation;
use shapejit_backend_ref_cpu::CpuPortableBackend;

fn f32_shape(sizes: &[usize]) -> Shape {
    Shape::array(DType::F32, sizes.to_vec())
}

fn run(
    computation: &Computation,
    inputs: &[Tensor<CpuPortableBackend>],
) -> Result<Vec<Tensor<CpuPortableBackend>>> {
    let backend = Arc::new(CpuPortableBackend::new());
    Tensor::apply_computation(&backend, computation, inputs)
}

#[test]
fn elementwise_and_reshape_shapes_are_inferred() -> Result<()> {
    let builder = ComputationBuilder::new("shapes");
    let a = builder.param(0, f32_shape(&[3, 4]))?;
    let b = builder.param(1, f32_shape(&[3, 4]))?;
    let sum = a.add(&b)?;
    assert_eq!(sum.shape(), &f32_shape(&[3, 4]));

    let c = builder.param(2, f32_shape(&[2, 6]))?;
    let reshaped = c.reshape(&[3, 4])?;
    assert_eq!(reshaped.shape(), &f32_shape(&[3, 4]));

    let mask = a.lt(&b)?;
    assert_eq!(mask.dtype(), DType::Pred);
    assert_eq!(mask.sizes(), &[3, 4]);

    let product = a.dot(&c.reshape(&[4, 3])?)?;
    assert_eq!(product.shape(), &f32_shape(&[3, 3]));
    Ok(())
}

#[test]
fn incompatible_operands_are_rejected_at_build_time() -> Result<()> {
    let builder = ComputationBuilder::new("bad");
    let a = builder.param(0, f32_shape(&[3, 4]))?;
    let b = builder.param(1, f32_shape(&[4, 3]))?;
    let err = a.add(&b).expect_err("mismatched shapes must fail");
    assert!(format!("{err:#}").contains("add"), "unexpected error: {err:#}");

    let ints = builder.param(2, Shape::array(DType::S32, vec![3, 4]))?;
    assert!(a.mul(&ints).is_err());
    assert!(a.reshape(&[5, 5]).is_err());
    Ok(())
}

#[test]
fn operands_from_two_builders_are_rejected() -> Result<()> {
    let first = ComputationBuilder::new("first");
    let second = ComputationBuilder::new("second");
    let a = first.param(0, f32_shape(&[2]))?;
    let b = second.param(0, f32_shape(&[2]))?;
    let err = a.add(&b).expect_err("cross-builder operands must fail");
    assert!(format!("{err:#}").contains("belongs to builder"));
    Ok(())
}

#[test]
#[should_panic(expected = "explicit builder")]
fn empty_tuple_without_builder_panics() {
    let _ = Op::tuple(&[], None);
}

#[test]
fn shapes_render_with_dynamic_markers_and_tuples() {
    let dynamic = Shape::create(DType::F32, vec![4, 2], Some(vec![true, false]));
    assert_eq!(dynamic.to_string(), "f32[<=4,2]");
    let tuple = Shape::tuple(vec![Shape::scalar(DType::F32), Shape::array(DType::S32, vec![2])]);
    assert_eq!(tuple.to_string(), "(f32[], s32[2])");
    assert_eq!(tuple.tuple_size(), 2);
    assert_eq!(tuple.tuple_element(1).sizes(), &[2]);
}

#[test]
#[should_panic]
fn array_accessor_on_tuple_panics() {
    let tuple = Shape::tuple(vec![Shape::scalar(DType::F32)]);
    let _ = tuple.sizes();
}

#[test]
fn deferred_body_is_traced_once_per_parameter_signature() -> Result<()> {
    let add = Body::deferred("add", |params: &[Op]| params[0].add(&params[1]));
    let builder = ComputationBuilder::new("reductions");
    let a = builder.param(0, f32_shape(&[2, 3]))?;
    let b = builder.param(1, f32_shape(&[5]))?;
    let zero = Op::zero(&builder, DType::F32)?;

    let rows = a.reduce(&zero, &add, &[1])?;
    assert_eq!(rows.shape(), &f32_shape(&[2]));
    let _ = b.reduce(&zero, &add, &[0])?;
    let _ = a.reduce_all(&zero, &add)?;
    assert_eq!(add.trace_count(), 1);

    let ints = builder.param(2, Shape::array(DType::S32, vec![4]))?;
    let int_zero = Op::zero(&builder, DType::S32)?;
    let _ = ints.reduce(&int_zero, &add, &[0])?;
    assert_eq!(add.trace_count(), 2);
    Ok(())
}

#[test]
fn reduce_and_slice_execute_on_reference_backend() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let add = Body::deferred("add", |params: &[Op]| params[0].add(&params[1]));
    let builder = ComputationBuilder::new("reduce_slice");
    let x = builder.param(0, f32_shape(&[2, 3]))?;
    let zero = Op::zero(&builder, DType::F32)?;
    let sums = x.reduce(&zero, &add, &[1])?;
    let tail = x.slice(&[0, 1], &[2, 3], None)?;
    let padded = x.pad(
        &zero,
        &[
            PadDim { low: 1, high: 0, interior: 0 },
            PadDim { low: 0, high: 0, interior: 0 },
        ],
    )?;
    let root = Op::tuple(&[sums, tail, padded], None)?;
    let computation = builder.build(&root)?;

    let input = Tensor::from_vec(
        Arc::clone(&backend),
        &[2, 3],
        &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0],
    )?;
    let outputs = run(&computation, &[input])?;
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0].to_vec::<f32>()?, vec![6.0, 15.0]);
    assert_eq!(outputs[1].to_vec::<f32>()?, vec![2.0, 3.0, 5.0, 6.0]);
    assert_eq!(outputs[2].shape().sizes(), &[3, 3]);
    assert_eq!(
        outputs[2].to_vec::<f32>()?,
        vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
    Ok(())
}

#[test]
fn while_loop_counts_to_limit() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let builder = ComputationBuilder::new("loop");
    let start = builder.param(0, Shape::scalar(DType::S32))?;
    let acc = builder.param(1, Shape::scalar(DType::F32))?;
    let state = mkwhile(
        &[start, acc],
        |state: &[Op]| {
            let limit = state[0].scalar_like(5.0)?;
            state[0].lt(&limit)
        },
        |state: &[Op]| {
            let one = state[0].scalar_like(1.0)?;
            let two = state[1].scalar_like(2.0)?;
            Ok(vec![state[0].add(&one)?, state[1].mul(&two)?])
        },
    )?;
    assert!(state.shape().is_tuple());
    let computation = builder.build(&state)?;

    let counter = Tensor::from_vec(Arc::clone(&backend), &[], &[1i32])?;
    let acc = Tensor::scalar(Arc::clone(&backend), 1.5, DType::F32)?;
    let outputs = run(&computation, &[counter, acc])?;
    assert_eq!(outputs[0].to_vec::<i32>()?, vec![5]);
    assert_eq!(outputs[1].to_vec::<f32>()?, vec![24.0]);
    Ok(())
}

#[test]
fn conditional_picks_branch_from_predicate() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let builder = ComputationBuilder::new("branch");
    let x = builder.param(0, f32_shape(&[3]))?;
    let threshold = builder.param(1, Shape::scalar(DType::F32))?;
    let total = x.reduce_all(
        &Op::zero(&builder, DType::F32)?,
        &Body::deferred("add", |p: &[Op]| p[0].add(&p[1])),
    )?;
    let predicate = total.gt(&threshold)?;
    let result = mkconditional(
        &[x],
        &predicate,
        |ops: &[Op]| ops[0].neg(),
        |ops: &[Op]| {
            let two = ops[0].scalar_like(2.0)?.broadcast(ops[0].sizes())?;
            ops[0].mul(&two)
        },
    )?;
    let computation = builder.build(&result)?;

    let input = Tensor::from_vec(Arc::clone(&backend), &[3], &[1.0f32, 2.0, 3.0])?;
    let low = Tensor::scalar(Arc::clone(&backend), 1.0, DType::F32)?;
    let high = Tensor::scalar(Arc::clone(&backend), 10.0, DType::F32)?;
    assert_eq!(
        run(&computation, &[input.clone(), low])?[0].to_vec::<f32>()?,
        vec![-1.0, -2.0, -3.0]
    );
    assert_eq!(run(&computation, &[input, high])?[0].to_vec::<f32>()?, vec![2.0, 4.0, 6.0]);
    Ok(())
}

#[test]
fn sort_orders_keys_and_carries_values() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let builder = ComputationBuilder::new("sort");
    let keys = builder.param(0, f32_shape(&[4]))?;
    let values = builder.param(1, Shape::array(DType::S32, vec![4]))?;
    let sorted = Op::sort(&[keys, values], None, 0, true, None)?;
    let computation = builder.build(&sorted)?;

    let keys = Tensor::from_vec(Arc::clone(&backend), &[4], &[3.0f32, 1.0, 2.0, 0.5])?;
    let values = Tensor::from_vec(Arc::clone(&backend), &[4], &[0i32, 1, 2, 3])?;
    let outputs = run(&computation, &[keys, values])?;
    assert_eq!(outputs[0].to_vec::<f32>()?, vec![0.5, 1.0, 2.0, 3.0]);
    assert_eq!(outputs[1].to_vec::<i32>()?, vec![3, 1, 2, 0]);
    Ok(())
}

#[test]
fn same_padding_convolution_and_pooling_keep_spatial_size() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let builder = ComputationBuilder::new("conv");
    let image = builder.param(0, f32_shape(&[1, 1, 3, 3]))?;
    let kernel = builder.param(1, f32_shape(&[1, 1, 3, 3]))?;
    let conv = image.conv(&kernel, &[1, 1], &Padding::Same, 1, 1)?;
    assert_eq!(conv.shape(), &f32_shape(&[1, 1, 3, 3]));
    let pooled = image.max_pool(
        &[2, 2],
        &[1, 1],
        &Padding::Valid,
        shapejit::backend::spec::DataFormat::nchw(2),
    )?;
    assert_eq!(pooled.shape(), &f32_shape(&[1, 1, 2, 2]));
    let computation = builder.build(&Op::tuple(&[conv, pooled], None)?)?;

    let pixels: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let image = Tensor::from_vec(Arc::clone(&backend), &[1, 1, 3, 3], &pixels)?;
    let kernel = Tensor::from_vec(Arc::clone(&backend), &[1, 1, 3, 3], &[1.0f32; 9])?;
    let outputs = run(&computation, &[image, kernel])?;
    assert_eq!(
        outputs[0].to_vec::<f32>()?,
        vec![12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0]
    );
    assert_eq!(outputs[1].to_vec::<f32>()?, vec![5.0, 6.0, 8.0, 9.0]);
    Ok(())
}

#[test]
fn computation_trace_freezes_multi_output_bodies() -> Result<()> {
    let computation = Computation::trace("pair", &[f32_shape(&[2]), f32_shape(&[2])], |args| {
        Ok(vec![args[0].add(&args[1])?, args[0].sub(&args[1])?])
    })?;
    assert_eq!(computation.num_parameters(), 2);
    assert_eq!(computation.result_shapes(), vec![f32_shape(&[2]), f32_shape(&[2])]);

    let backend = Arc::new(CpuPortableBackend::new());
    let a = Tensor::from_vec(Arc::clone(&backend), &[2], &[5.0f32, 7.0])?;
    let b = Tensor::from_vec(Arc::clone(&backend), &[2], &[1.0f32, 2.0])?;
    let outputs = run(&computation, &[a, b])?;
    assert_eq!(outputs[0].to_vec::<f32>()?, vec![6.0, 9.0]);
    assert_eq!(outputs[1].to_vec::<f32>()?, vec![4.0, 5.0]);
    Ok(())
}

#[test]
fn concat_and_like_constants_fill_expected_values() -> Result<()> {
    let builder = ComputationBuilder::new("concat");
    let x = builder.param(0, f32_shape(&[2, 2]))?;
    let joined = Op::concat_in_dim(&[x.zeros_like()?, x.clone(), x.ones_like()?], 0, None)?;
    assert_eq!(joined.shape(), &f32_shape(&[6, 2]));
    let computation = builder.build(&joined)?;

    let backend = Arc::new(CpuPortableBackend::new());
    let input = Tensor::from_vec(Arc::clone(&backend), &[2, 2], &[5.0f32, 6.0, 7.0, 8.0])?;
    let outputs = run(&computation, &[input])?;
    assert_eq!(
        outputs[0].to_vec::<f32>()?,
        vec![0.0, 0.0, 0.0, 0.0, 5.0, 6.0, 7.0, 8.0, 1.0, 1.0, 1.0, 1.0]
    );
    Ok(())
}

#[test]
fn explicit_padding_variants_match_window_arithmetic() -> Result<()> {
    let ge = Body::deferred("ge", |params: &[Op]| params[0].ge(&params[1]));
    let add = Body::deferred("add", |params: &[Op]| params[0].add(&params[1]));
    let builder = ComputationBuilder::new("windows");
    let image = builder.param(0, f32_shape(&[1, 1, 3, 3]))?;
    let kernel = builder.param(1, f32_shape(&[1, 1, 2, 2]))?;
    let conv = image.conv_with_general_padding(
        &kernel,
        &[1, 1],
        &[(0, 0), (0, 0)],
        &[1, 1],
        &[1, 1],
        1,
        1,
    )?;
    assert_eq!(conv.shape(), &f32_shape(&[1, 1, 2, 2]));

    let values = builder.param(2, f32_shape(&[4]))?;
    let source = builder.param(3, f32_shape(&[2]))?;
    let zero = Op::zero(&builder, DType::F32)?;
    let scattered = values.select_and_scatter_with_general_padding(
        &source,
        &zero,
        &ge,
        &add,
        &[2],
        &[2],
        &[(0, 0)],
    )?;
    assert_eq!(scattered.shape(), &f32_shape(&[4]));
    let computation = builder.build(&Op::tuple(&[conv, scattered], None)?)?;

    let backend = Arc::new(CpuPortableBackend::new());
    let pixels: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let outputs = run(
        &computation,
        &[
            Tensor::from_vec(Arc::clone(&backend), &[1, 1, 3, 3], &pixels)?,
            Tensor::from_vec(Arc::clone(&backend), &[1, 1, 2, 2], &[1.0f32; 4])?,
            Tensor::from_vec(Arc::clone(&backend), &[4], &[1.0f32, 3.0, 2.0, 0.0])?,
            Tensor::from_vec(Arc::clone(&backend), &[2], &[10.0f32, 20.0])?,
        ],
    )?;
    assert_eq!(outputs[0].to_vec::<f32>()?, vec![12.0, 16.0, 24.0, 28.0]);
    assert_eq!(outputs[1].to_vec::<f32>()?, vec![0.0, 10.0, 20.0, 0.0]);
    Ok(())
}
