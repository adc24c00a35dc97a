//! Stdlib registration
//!
//! Registers the iterator methods on the `iterable` pseudo-receiver, the
//! driver resume entries, the checkpoint restore factories for every
//! iterator kind, and the suspension built-ins (`sleep`, `die`,
//! `checkpoint`) into the process-wide registry. Registration is
//! idempotent and guarded; call [`register_all`] (or `quill_stdlib::init`)
//! once before running scripts.

use std::sync::Arc;

use quill_core::error::{RunResult, RuntimeError};
use quill_core::object::{ArrayData, ArrayKind, TypedArray};
use quill_core::registry::{
    self, FunctionDef, FunctionFlags, Invocation, ParamDef, ParamType,
};
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, Step, StepResult,
};
use quill_core::value::Value;

use crate::iter::batch::{read_grouped_iter, GroupedIter};
use crate::iter::slice::{read_limit_iter, read_skip_iter, read_unique_iter, LimitIter, SkipIter, UniqueIter};
use crate::iter::sort::{read_reverse_iter, read_sort_iter, ReverseIter, SortIter};
use crate::iter::transform::{
    read_filter_iter, read_flat_map_iter, read_map_iter, FilterIter, FlatMapIter, MapIter,
};
use crate::iter::{iter_source, read_list_iter};
use crate::matching::{self, MatchKind};
use crate::reduce::{self, ReduceKind};

/// Register the whole stdlib (idempotent)
pub fn register_all() {
    registry::init_once("quill-stdlib", || {
        register_resume_entries();
        register_iter_readers();
        register_pipeline_methods();
        register_terminal_methods();
        register_builtins();
        log::debug!("quill-stdlib registered");
    });
}

fn register_resume_entries() {
    registry::register_resume_fn(reduce::RESUME_NAME, reduce::resume);
    registry::register_resume_fn(matching::RESUME_NAME, matching::resume);
}

fn register_iter_readers() {
    registry::register_iter_reader("iter.list_source", Arc::new(read_list_iter));
    registry::register_iter_reader("iter.map", Arc::new(read_map_iter));
    registry::register_iter_reader("iter.filter", Arc::new(read_filter_iter));
    registry::register_iter_reader("iter.flat_map", Arc::new(read_flat_map_iter));
    registry::register_iter_reader("iter.unique", Arc::new(read_unique_iter));
    registry::register_iter_reader("iter.skip", Arc::new(read_skip_iter));
    registry::register_iter_reader("iter.limit", Arc::new(read_limit_iter));
    registry::register_iter_reader("iter.grouped", Arc::new(read_grouped_iter));
    registry::register_iter_reader("iter.reverse", Arc::new(read_reverse_iter));
    registry::register_iter_reader("iter.sort", Arc::new(read_sort_iter));
}

fn receiver_iter(inv: &Invocation) -> StepResult<IterValue> {
    let receiver = inv
        .receiver
        .as_ref()
        .ok_or_else(|| RuntimeError::new("Method called without a receiver", inv.loc.clone()))?;
    Ok(Step::Ready(iter_source(receiver, &inv.loc)?))
}

fn arg_fn(inv: &Invocation, i: usize) -> RunResult<FunctionValue> {
    match inv.args.get(i) {
        Some(Value::Function(f)) => Ok(f.clone()),
        other => Err(RuntimeError::new(
            format!(
                "Expected a function argument, got {}",
                other.map(|v| v.type_name()).unwrap_or("nothing")
            ),
            inv.loc.clone(),
        )),
    }
}

fn arg_opt_fn(inv: &Invocation, i: usize) -> RunResult<Option<FunctionValue>> {
    match inv.args.get(i) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Function(f)) => Ok(Some(f.clone())),
        Some(other) => Err(RuntimeError::new(
            format!("Expected a function argument, got {}", other.type_name()),
            inv.loc.clone(),
        )),
    }
}

fn iterable_method(
    name: &'static str,
    params: Vec<ParamDef>,
    async_params: &'static [usize],
    imp: impl Fn(IterValue, Invocation) -> StepResult<Value> + Send + Sync + 'static,
) {
    registry::register_method(FunctionDef {
        name: name.to_string(),
        receiver: Some("iterable"),
        params,
        flags: FunctionFlags {
            async_instance: true,
            async_params,
            needs_location: true,
            var_args: false,
        },
        imp: Arc::new(move |inv: Invocation| {
            let upstream = match receiver_iter(&inv)? {
                Step::Ready(it) => it,
                Step::Suspended(c) => return Ok(Step::Suspended(c)),
            };
            imp(upstream, inv)
        }),
    });
}

fn register_pipeline_methods() {
    iterable_method(
        "map",
        vec![ParamDef::required("mapper", ParamType::Function)],
        &[0],
        |up, inv| {
            let mapper = arg_fn(&inv, 0)?;
            Ok(Step::Ready(Value::Iterator(IterValue::new(MapIter::new(
                up, mapper, false,
            )))))
        },
    );

    iterable_method(
        "mapWithIndex",
        vec![ParamDef::required("mapper", ParamType::Function)],
        &[0],
        |up, inv| {
            let mapper = arg_fn(&inv, 0)?;
            Ok(Step::Ready(Value::Iterator(IterValue::new(MapIter::new(
                up, mapper, true,
            )))))
        },
    );

    iterable_method(
        "filter",
        vec![ParamDef::optional("predicate", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let pred = arg_opt_fn(&inv, 0)?;
            Ok(Step::Ready(Value::Iterator(IterValue::new(
                FilterIter::new(up, pred),
            ))))
        },
    );

    iterable_method(
        "flatMap",
        vec![ParamDef::optional("mapper", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let mapper = arg_opt_fn(&inv, 0)?;
            Ok(Step::Ready(Value::Iterator(IterValue::new(
                FlatMapIter::new(up, mapper),
            ))))
        },
    );

    iterable_method("unique", vec![], &[], |up, _inv| {
        Ok(Step::Ready(Value::Iterator(IterValue::new(
            UniqueIter::new(up),
        ))))
    });

    iterable_method(
        "skip",
        vec![ParamDef::required("count", ParamType::Long)],
        &[],
        |up, inv| {
            let n = inv.args[0].as_long().unwrap_or(0);
            Ok(Step::Ready(Value::Iterator(IterValue::new(SkipIter::new(
                up, n,
            )))))
        },
    );

    iterable_method(
        "limit",
        vec![ParamDef::required("count", ParamType::Long)],
        &[],
        |up, inv| {
            let n = inv.args[0].as_long().unwrap_or(0);
            Ok(Step::Ready(Value::Iterator(IterValue::new(
                LimitIter::new(up, n),
            ))))
        },
    );

    iterable_method(
        "grouped",
        vec![ParamDef::required("size", ParamType::Long)],
        &[],
        |up, inv| {
            let size = batch_size(&inv)?;
            Ok(Step::Ready(Value::Iterator(match size {
                // Size zero leaves the upstream unchanged
                0 => up,
                k => IterValue::new(GroupedIter::new(up, k, k)),
            })))
        },
    );

    iterable_method(
        "windowSliding",
        vec![ParamDef::required("size", ParamType::Long)],
        &[],
        |up, inv| {
            let size = batch_size(&inv)?;
            Ok(Step::Ready(Value::Iterator(match size {
                0 => up,
                k => IterValue::new(GroupedIter::new(up, k, 1)),
            })))
        },
    );

    iterable_method("reverse", vec![], &[], |up, _inv| {
        Ok(Step::Ready(Value::Iterator(IterValue::new(
            ReverseIter::new(up),
        ))))
    });

    iterable_method(
        "sort",
        vec![ParamDef::optional("comparator", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let cmp = arg_opt_fn(&inv, 0)?;
            Ok(Step::Ready(Value::Iterator(IterValue::new(SortIter::new(
                up, cmp,
            )))))
        },
    );
}

fn batch_size(inv: &Invocation) -> RunResult<usize> {
    let size = inv.args[0].as_long().unwrap_or(0);
    if size < 0 {
        return Err(RuntimeError::new(
            format!("Batch size must not be negative (got {})", size),
            inv.loc.clone(),
        ));
    }
    Ok(size as usize)
}

fn register_terminal_methods() {
    iterable_method(
        "collect",
        vec![ParamDef::optional("mapper", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let mapper = arg_opt_fn(&inv, 0)?;
            reduce::drive(
                ReduceKind::Collect,
                up,
                mapper,
                Value::list(vec![]),
                Value::Null,
                inv.loc,
            )
        },
    );

    iterable_method(
        "collectEntries",
        vec![ParamDef::optional("mapper", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let mapper = arg_opt_fn(&inv, 0)?;
            reduce::drive(
                ReduceKind::CollectEntries,
                up,
                mapper,
                Value::empty_map(),
                Value::Null,
                inv.loc,
            )
        },
    );

    iterable_method(
        "reduce",
        vec![
            ParamDef::required("initial", ParamType::Any),
            ParamDef::required("accumulator", ParamType::Function),
        ],
        &[1],
        |up, inv| {
            let initial = inv.args[0].clone();
            let acc_fn = arg_fn(&inv, 1)?;
            reduce::drive(
                ReduceKind::Reduce,
                up,
                Some(acc_fn),
                initial,
                Value::Null,
                inv.loc,
            )
        },
    );

    iterable_method(
        "join",
        vec![ParamDef::optional("separator", ParamType::Str, Value::str(""))],
        &[],
        |up, inv| {
            // A null separator joins with no separator at all
            let sep = match inv.args.first() {
                Some(Value::Str(s)) => Value::str(s.as_ref()),
                _ => Value::str(""),
            };
            reduce::drive(
                ReduceKind::Join,
                up,
                None,
                Value::string_builder(),
                sep,
                inv.loc,
            )
        },
    );

    iterable_method("sum", vec![], &[], |up, inv| {
        reduce::drive(ReduceKind::Sum, up, None, Value::Int(0), Value::Null, inv.loc)
    });

    iterable_method("avg", vec![], &[], |up, inv| {
        reduce::drive(ReduceKind::Avg, up, None, Value::Int(0), Value::Null, inv.loc)
    });

    iterable_method(
        "min",
        vec![ParamDef::optional("comparator", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let key_fn = arg_opt_fn(&inv, 0)?;
            reduce::drive(ReduceKind::Min, up, key_fn, Value::Null, Value::Null, inv.loc)
        },
    );

    iterable_method(
        "max",
        vec![ParamDef::optional("comparator", ParamType::Function, Value::Null)],
        &[0],
        |up, inv| {
            let key_fn = arg_opt_fn(&inv, 0)?;
            reduce::drive(ReduceKind::Max, up, key_fn, Value::Null, Value::Null, inv.loc)
        },
    );

    iterable_method(
        "groupBy",
        vec![ParamDef::required("keyMapper", ParamType::Function)],
        &[0],
        |up, inv| {
            let key_fn = arg_fn(&inv, 0)?;
            reduce::drive(
                ReduceKind::GroupBy,
                up,
                Some(key_fn),
                Value::empty_map(),
                Value::Null,
                inv.loc,
            )
        },
    );

    iterable_method("transpose", vec![], &[], |up, inv| {
        reduce::drive(
            ReduceKind::Transpose,
            up,
            None,
            Value::list(vec![]),
            Value::Null,
            inv.loc,
        )
    });

    iterable_method(
        "each",
        vec![ParamDef::required("action", ParamType::Function)],
        &[0],
        |up, inv| {
            let action = arg_fn(&inv, 0)?;
            reduce::drive(
                ReduceKind::Each,
                up,
                Some(action),
                Value::Null,
                Value::Null,
                inv.loc,
            )
        },
    );

    iterable_method(
        "subList",
        vec![
            ParamDef::required("start", ParamType::Long),
            ParamDef::optional("end", ParamType::Long, Value::Null),
        ],
        &[],
        |up, inv| {
            let bounds = Value::list(vec![inv.args[0].clone(), inv.args[1].clone()]);
            reduce::drive(
                ReduceKind::SubList,
                up,
                None,
                Value::list(vec![]),
                bounds,
                inv.loc,
            )
        },
    );

    for name in ["allMatch", "anyMatch", "noneMatch"] {
        let kind = match name {
            "allMatch" => MatchKind::All,
            "anyMatch" => MatchKind::Any,
            _ => MatchKind::None,
        };
        iterable_method(
            name,
            vec![ParamDef::optional("predicate", ParamType::Function, Value::Null)],
            &[0],
            move |up, inv| {
                let pred = arg_opt_fn(&inv, 0)?;
                matching::drive(kind, up, pred, inv.loc)
            },
        );
    }

    for name in ["size", "count"] {
        registry::register_method(FunctionDef {
            name: name.to_string(),
            receiver: Some("iterable"),
            params: vec![],
            flags: FunctionFlags {
                async_instance: true,
                async_params: &[],
                needs_location: true,
                var_args: false,
            },
            imp: Arc::new(|inv: Invocation| {
                let receiver = inv.receiver.as_ref().ok_or_else(|| {
                    RuntimeError::new("Method called without a receiver", inv.loc.clone())
                })?;
                // Direct containers answer without materializing
                match receiver {
                    Value::List(l) => return Ok(Step::Ready(Value::Int(l.lock().len() as i32))),
                    Value::Map(m) => return Ok(Step::Ready(Value::Int(m.lock().len() as i32))),
                    Value::Array(a) => {
                        return Ok(Step::Ready(Value::Int(a.lock().len() as i32)))
                    }
                    _ => {}
                }
                let up = iter_source(receiver, &inv.loc)?;
                reduce::drive(ReduceKind::Size, up, None, Value::Null, Value::Null, inv.loc)
            }),
        });
    }
}

fn register_builtins() {
    // sleep(ms) parks the fiber on the worker pool
    registry::register_function(FunctionDef {
        name: "sleep".to_string(),
        receiver: None,
        params: vec![ParamDef::required("millis", ParamType::Long)],
        flags: FunctionFlags {
            needs_location: true,
            ..FunctionFlags::NONE
        },
        imp: Arc::new(|inv: Invocation| {
            let ms = inv.args[0].as_long().unwrap_or(0);
            if ms <= 0 {
                return Ok(Step::Ready(Value::Null));
            }
            Ok(Step::Suspended(Continuation::suspend_blocking(
                inv.loc,
                Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(ms as u64));
                    Ok(Value::Null)
                }),
            )))
        }),
    });

    // die(message) aborts the script
    registry::register_function(FunctionDef {
        name: "die".to_string(),
        receiver: None,
        params: vec![ParamDef::optional("message", ParamType::Str, Value::str("die"))],
        flags: FunctionFlags {
            needs_location: true,
            ..FunctionFlags::NONE
        },
        imp: Arc::new(|inv: Invocation| {
            let msg = inv.args[0].as_str().unwrap_or("die").to_string();
            Err(RuntimeError::die(msg, inv.loc))
        }),
    });

    // checkpoint(commit?, recover?) snapshots the live fiber
    registry::register_function(FunctionDef {
        name: "checkpoint".to_string(),
        receiver: None,
        params: vec![
            ParamDef::optional("commit", ParamType::Function, Value::Null),
            ParamDef::optional("recover", ParamType::Function, Value::Null),
        ],
        flags: FunctionFlags {
            needs_location: true,
            async_params: &[0, 1],
            ..FunctionFlags::NONE
        },
        imp: Arc::new(|inv: Invocation| {
            let commit = match &inv.args[0] {
                Value::Null => None,
                Value::Function(f) => {
                    let f = f.clone();
                    let commit: quill_core::suspend::CommitFn = Box::new(move |bytes: &[u8]| {
                        let data = bytes.iter().map(|b| *b as i32).collect::<Vec<_>>();
                        let image = Value::array(TypedArray::new(
                            ArrayKind::Int,
                            ArrayData::Int(data),
                        ));
                        match f.invoke(&[image])? {
                            Step::Ready(v) => Ok(v),
                            Step::Suspended(_) => Err(RuntimeError::msg(
                                "Checkpoint commit callback may not suspend",
                            )),
                        }
                    });
                    Some(commit)
                }
                other => {
                    return Err(RuntimeError::new(
                        format!("checkpoint() commit must be a function, got {}", other.type_name()),
                        inv.loc,
                    ))
                }
            };
            let recover = match &inv.args[1] {
                Value::Null => None,
                f @ Value::Function(_) => Some(f.clone()),
                other => {
                    return Err(RuntimeError::new(
                        format!(
                            "checkpoint() recover must be a function, got {}",
                            other.type_name()
                        ),
                        inv.loc,
                    ))
                }
            };
            Ok(Step::Suspended(Continuation::checkpoint_request(
                inv.loc, commit, recover,
            )))
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::error::SourceLoc;
    use quill_core::registry::Args;

    fn call(receiver: Value, name: &str, args: Vec<Value>) -> StepResult<Value> {
        register_all();
        registry::call_method(&receiver, name, Args::Positional(args), SourceLoc::internal())
    }

    fn ready(step: StepResult<Value>) -> Value {
        match step.unwrap() {
            Step::Ready(v) => v,
            Step::Suspended(_) => panic!("unexpected suspension"),
        }
    }

    fn int_list(vals: &[i32]) -> Value {
        Value::list(vals.iter().map(|i| Value::Int(*i)).collect())
    }

    #[test]
    fn test_sum_method() {
        let v = ready(call(int_list(&[1, 2, 3]), "sum", vec![]));
        assert_eq!(v.as_int(), Some(6));
    }

    #[test]
    fn test_sort_then_collect() {
        let sorted = ready(call(int_list(&[3, 1, 2]), "sort", vec![]));
        let v = ready(call(sorted, "collect", vec![]));
        if let Value::List(l) = v {
            let out: Vec<i32> = l.lock().iter().map(|v| v.as_int().unwrap()).collect();
            assert_eq!(out, vec![1, 2, 3]);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_grouped_zero_is_identity() {
        let it = ready(call(int_list(&[1, 2]), "grouped", vec![Value::Int(0)]));
        let v = ready(call(it, "collect", vec![]));
        if let Value::List(l) = v {
            assert_eq!(l.lock().len(), 2);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_grouped_negative_errors() {
        register_all();
        let err = registry::call_method(
            &int_list(&[1]),
            "grouped",
            Args::Positional(vec![Value::Int(-1)]),
            SourceLoc::internal(),
        )
        .err()
        .unwrap();
        assert!(err.message.contains("negative"));
    }

    #[test]
    fn test_size_on_direct_list() {
        let v = ready(call(int_list(&[1, 2, 3]), "size", vec![]));
        assert_eq!(v.as_int(), Some(3));
    }

    #[test]
    fn test_sublist_negative_bounds() {
        let v = ready(call(
            int_list(&[1, 2, 3, 4]),
            "subList",
            vec![Value::Int(1), Value::Int(-1)],
        ));
        if let Value::List(l) = v {
            let out: Vec<i32> = l.lock().iter().map(|v| v.as_int().unwrap()).collect();
            assert_eq!(out, vec![2, 3]);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_sublist_default_end() {
        let v = ready(call(int_list(&[1, 2, 3]), "subList", vec![Value::Int(1)]));
        if let Value::List(l) = v {
            assert_eq!(l.lock().len(), 2);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_die_builtin() {
        register_all();
        let err = registry::call_function(
            "die",
            Args::Positional(vec![Value::str("stop now")]),
            SourceLoc::internal(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind, quill_core::error::ErrorKind::Die);
        assert_eq!(err.message, "stop now");
    }

    #[test]
    fn test_join_scenarios() {
        let strs = Value::list(vec![Value::str("a"), Value::str("b"), Value::str("c")]);
        let v = ready(call(strs, "join", vec![Value::str(",")]));
        assert_eq!(v.as_str(), Some("a,b,c"));

        let one = Value::list(vec![Value::str("a")]);
        let v = ready(call(one, "join", vec![Value::str(",")]));
        assert_eq!(v.as_str(), Some("a"));

        let empty = Value::list(vec![]);
        let v = ready(call(empty, "join", vec![Value::str(",")]));
        assert_eq!(v.as_str(), Some(""));
    }
}
