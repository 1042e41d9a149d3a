use std::collections::BTreeMap;

use anyhow::Result;
use shapejit::tree::{
    flatten, flatten_call, Arg, CallArgs, FlattenError, FlattenedInputFunc, StaticLeaf,
};

#[test]
fn positional_then_keyword_leaves_round_trip() -> Result<()> {
    let call = CallArgs::new(vec![Arg::int(5), Arg::Tensor("a")]).with_kwarg("k", Arg::Tensor("b"));
    let (leaves, layout) = flatten_call(&call);
    assert_eq!(leaves, vec!["a", "b"]);
    assert_eq!(layout.num_tensors(), 2);
    assert!(layout.statics().contains(&Some(StaticLeaf::Int(5))));
    assert!(layout.describe().contains("\"k\""));

    let rebuilt = layout.unflatten_call(vec!["a2", "b2"])?;
    assert_eq!(rebuilt.args, vec![Arg::int(5), Arg::Tensor("a2")]);
    assert_eq!(rebuilt.kwargs.get("k"), Some(&Arg::Tensor("b2")));
    Ok(())
}

#[test]
fn nested_containers_keep_traversal_order() -> Result<()> {
    let mut inner = BTreeMap::new();
    inner.insert("z".to_string(), Arg::Tensor(3));
    inner.insert("a".to_string(), Arg::Tensor(2));
    let value = Arg::Tuple(vec![
        Arg::Tensor(1),
        Arg::Dict(inner),
        Arg::List(vec![Arg::str("mode"), Arg::Tensor(4), Arg::none()]),
    ]);
    let (leaves, layout) = flatten(&value);
    assert_eq!(leaves, vec![1, 2, 3, 4]);
    assert_eq!(layout.structure.num_leaves(), 7);

    let doubled = layout.unflatten(leaves.iter().map(|leaf| leaf * 2).collect())?;
    assert_eq!(doubled.tensors(), vec![&2, &4, &6, &8]);
    Ok(())
}

#[test]
fn unflatten_rejects_wrong_leaf_count() {
    let (_, layout) = flatten(&Arg::Tuple(vec![Arg::Tensor(1), Arg::Tensor(2)]));
    let err = layout.unflatten(vec![1]).expect_err("one leaf is missing");
    assert_eq!(err, FlattenError::LeafCount { expected: 2, found: 1 });
}

#[test]
fn flattened_function_records_output_layout_once() -> Result<()> {
    let func = FlattenedInputFunc::new(|call: CallArgs<i64>| -> Result<Arg<i64>> {
        let scale = match call.kwargs.get("scale").and_then(Arg::as_static) {
            Some(StaticLeaf::Int(value)) => *value,
            _ => 1,
        };
        let values: Vec<Arg<i64>> = call
            .args
            .iter()
            .filter_map(Arg::as_tensor)
            .map(|value| Arg::Tensor(value * scale))
            .collect();
        Ok(Arg::List(values))
    });

    let call = CallArgs::tensors([1, 2]).with_kwarg("scale", Arg::int(3));
    let flat = func.preprocess(&call);
    assert_eq!(flat, vec![1, 2]);
    let outputs = func.flat_call(flat)?;
    assert_eq!(outputs, vec![3, 6]);
    let result = func.postprocess(outputs)?;
    assert_eq!(result, Arg::List(vec![Arg::Tensor(3), Arg::Tensor(6)]));
    assert!(func.output_layout().is_ok());
    Ok(())
}

#[test]
fn flattened_function_rejects_changing_result_structure() -> Result<()> {
    let func = FlattenedInputFunc::new(|call: CallArgs<i64>| -> Result<Arg<i64>> {
        Ok(Arg::Tuple(call.args))
    });
    func.preprocess(&CallArgs::tensors([1]));
    func.flat_call(vec![1])?;

    func.preprocess(&CallArgs::tensors([1, 2]));
    let err = func.flat_call(vec![1, 2]).expect_err("result structure changed");
    assert!(matches!(
        err.downcast_ref::<FlattenError>(),
        Some(FlattenError::StructureMismatch { .. })
    ));
    Ok(())
}

#[test]
fn calls_before_preprocess_fail() {
    let func = FlattenedInputFunc::new(|call: CallArgs<i64>| -> Result<Arg<i64>> {
        Ok(Arg::Tuple(call.args))
    });
    let err = func.flat_call(vec![1]).expect_err("input layout is missing");
    assert!(matches!(
        err.downcast_ref::<FlattenError>(),
        Some(FlattenError::NotPreprocessed { missing: "input", .. })
    ));
    let err = func.postprocess(vec![1]).expect_err("output layout is missing");
    assert!(matches!(
        err.downcast_ref::<FlattenError>(),
        Some(FlattenError::NotPreprocessed { missing: "output", .. })
    ));
}

#[test]
fn static_leaves_distinguish_layouts() {
    let (_, two) = flatten_call(&CallArgs::<i64>::new(vec![Arg::int(2)]));
    let (_, three) = flatten_call(&CallArgs::<i64>::new(vec![Arg::int(3)]));
    let (_, float) = flatten_call(&CallArgs::<i64>::new(vec![Arg::float(2.0)]));
    assert_ne!(two, three);
    assert_ne!(two, float);
    assert!(two.ensure_matches(&two.clone()).is_ok());
    assert!(matches!(
        two.ensure_matches(&three),
        Err(FlattenError::StructureMismatch { .. })
    ));
}
