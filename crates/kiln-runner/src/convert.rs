//! Value conversion between wire shapes and live Python objects.

use std::collections::BTreeMap;
use std::path::PathBuf;

use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyTuple};

use kiln_codec::{ArgMap, ToolValue};

/// Converts [`ToolValue`]s to Python objects and back.
///
/// Holds the `pathlib` classes so that path values cross the boundary as
/// real `pathlib.Path` instances rather than strings.
pub struct ValueBridge<'py> {
    path_cls: Bound<'py, PyAny>,
    pure_path_cls: Bound<'py, PyAny>,
}

impl<'py> ValueBridge<'py> {
    /// Import `pathlib` and capture the classes the bridge needs.
    pub fn new(py: Python<'py>) -> PyResult<Self> {
        let pathlib = PyModule::import_bound(py, "pathlib")?;
        Ok(Self {
            path_cls: pathlib.getattr("Path")?,
            pure_path_cls: pathlib.getattr("PurePath")?,
        })
    }

    /// Build the keyword-argument dict for the entry call.
    pub fn kwargs(&self, py: Python<'py>, args: &ArgMap) -> PyResult<Bound<'py, PyDict>> {
        let kwargs = PyDict::new_bound(py);
        for (name, value) in args {
            kwargs.set_item(name, self.to_python(py, value)?)?;
        }
        Ok(kwargs)
    }

    /// Convert one wire value into a Python object.
    pub fn to_python(&self, py: Python<'py>, value: &ToolValue) -> PyResult<PyObject> {
        Ok(match value {
            ToolValue::Null => py.None(),
            ToolValue::Bool(flag) => flag.into_py(py),
            ToolValue::Int(int) => int.into_py(py),
            ToolValue::Float(float) => float.into_py(py),
            ToolValue::Str(text) => text.as_str().into_py(py),
            ToolValue::Path(path) => {
                let text = path.to_string_lossy().into_owned();
                self.path_cls.call1((text,))?.unbind()
            }
            ToolValue::List(items) => {
                let converted = items
                    .iter()
                    .map(|item| self.to_python(py, item))
                    .collect::<PyResult<Vec<_>>>()?;
                PyList::new_bound(py, converted).into_any().unbind()
            }
            ToolValue::Map(map) => {
                let dict = PyDict::new_bound(py);
                for (key, item) in map {
                    dict.set_item(key, self.to_python(py, item)?)?;
                }
                dict.into_any().unbind()
            }
        })
    }

    /// Convert a Python object into a wire value.
    ///
    /// `bool` is checked before the integer path because Python booleans
    /// are integers. Tuples come back as lists, which is what JSON would
    /// have made of them anyway. Anything outside the closed set raises
    /// `TypeError`, which the caller reports as an unserializable result.
    pub fn to_value(&self, value: &Bound<'_, PyAny>) -> PyResult<ToolValue> {
        if value.is_none() {
            return Ok(ToolValue::Null);
        }
        if let Ok(flag) = value.extract::<bool>() {
            return Ok(ToolValue::Bool(flag));
        }
        if let Ok(int) = value.extract::<i64>() {
            return Ok(ToolValue::Int(int));
        }
        if let Ok(float) = value.extract::<f64>() {
            if !float.is_finite() {
                return Err(PyTypeError::new_err(
                    "cannot serialize a non-finite float result",
                ));
            }
            return Ok(ToolValue::Float(float));
        }
        if let Ok(text) = value.extract::<String>() {
            return Ok(ToolValue::Str(text));
        }
        if value.is_instance(&self.pure_path_cls)? {
            let text = value.str()?.to_string_lossy().into_owned();
            return Ok(ToolValue::Path(PathBuf::from(text)));
        }
        if let Ok(list) = value.downcast::<PyList>() {
            let mut items = Vec::with_capacity(list.len());
            for item in list.iter() {
                items.push(self.to_value(&item)?);
            }
            return Ok(ToolValue::List(items));
        }
        if let Ok(tuple) = value.downcast::<PyTuple>() {
            let mut items = Vec::with_capacity(tuple.len());
            for item in tuple.iter() {
                items.push(self.to_value(&item)?);
            }
            return Ok(ToolValue::List(items));
        }
        if let Ok(dict) = value.downcast::<PyDict>() {
            let mut map = BTreeMap::new();
            for (key, item) in dict.iter() {
                let Ok(key) = key.extract::<String>() else {
                    return Err(PyTypeError::new_err(
                        "cannot serialize a dict with non-string keys",
                    ));
                };
                map.insert(key, self.to_value(&item)?);
            }
            return Ok(ToolValue::Map(map));
        }

        let type_name = value
            .get_type()
            .getattr("__name__")
            .and_then(|name| name.extract::<String>())
            .unwrap_or_else(|_| "object".to_string());
        Err(PyTypeError::new_err(format!(
            "cannot serialize result of type '{type_name}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_bridge<R>(f: impl FnOnce(Python<'_>, &ValueBridge<'_>) -> R) -> R {
        Python::with_gil(|py| {
            let bridge = ValueBridge::new(py).unwrap();
            f(py, &bridge)
        })
    }

    fn roundtrip(value: ToolValue) -> ToolValue {
        with_bridge(|py, bridge| {
            let obj = bridge.to_python(py, &value).unwrap();
            bridge.to_value(obj.bind(py)).unwrap()
        })
    }

    #[test]
    fn scalars_roundtrip() {
        assert_eq!(roundtrip(ToolValue::Null), ToolValue::Null);
        assert_eq!(roundtrip(ToolValue::Int(-7)), ToolValue::Int(-7));
        assert_eq!(roundtrip(ToolValue::Float(2.5)), ToolValue::Float(2.5));
        assert_eq!(
            roundtrip(ToolValue::Str("héllo".to_string())),
            ToolValue::Str("héllo".to_string())
        );
    }

    #[test]
    fn booleans_do_not_collapse_into_integers() {
        assert_eq!(roundtrip(ToolValue::Bool(true)), ToolValue::Bool(true));
        assert_eq!(roundtrip(ToolValue::Int(1)), ToolValue::Int(1));
        assert_eq!(roundtrip(ToolValue::Int(0)), ToolValue::Int(0));
    }

    #[test]
    fn paths_become_pathlib_instances() {
        with_bridge(|py, bridge| {
            let obj = bridge
                .to_python(py, &ToolValue::Path(PathBuf::from("/data/in.csv")))
                .unwrap();
            let bound = obj.bind(py);
            assert!(bound.is_instance(&bridge.path_cls).unwrap());
            assert_eq!(
                bridge.to_value(bound).unwrap(),
                ToolValue::Path(PathBuf::from("/data/in.csv"))
            );
        });
    }

    #[test]
    fn containers_roundtrip_nested() {
        let value = ToolValue::Map(BTreeMap::from([
            (
                "rows".to_string(),
                ToolValue::List(vec![ToolValue::Int(1), ToolValue::Str("x".to_string())]),
            ),
            ("empty".to_string(), ToolValue::Null),
        ]));
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn tuples_come_back_as_lists() {
        with_bridge(|py, bridge| {
            let obj = py.eval_bound("(1, 'two')", None, None).unwrap();
            assert_eq!(
                bridge.to_value(&obj).unwrap(),
                ToolValue::List(vec![ToolValue::Int(1), ToolValue::Str("two".to_string())])
            );
        });
    }

    #[test]
    fn sets_are_rejected() {
        with_bridge(|py, bridge| {
            let obj = py.eval_bound("{1, 2}", None, None).unwrap();
            let err = bridge.to_value(&obj).unwrap_err();
            assert!(err.to_string().contains("set"), "got: {err}");
        });
    }

    #[test]
    fn non_string_dict_keys_are_rejected() {
        with_bridge(|py, bridge| {
            let obj = py.eval_bound("{1: 'a'}", None, None).unwrap();
            let err = bridge.to_value(&obj).unwrap_err();
            assert!(err.to_string().contains("non-string"), "got: {err}");
        });
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        with_bridge(|py, bridge| {
            for expr in ["float('inf')", "float('nan')"] {
                let obj = py.eval_bound(expr, None, None).unwrap();
                assert!(bridge.to_value(&obj).is_err(), "{expr} was serialized");
            }
        });
    }

    #[test]
    fn kwargs_carry_real_path_objects() {
        with_bridge(|py, bridge| {
            let args = ArgMap::from([
                ("data".to_string(), ToolValue::Path(PathBuf::from("/w/in.txt"))),
                ("count".to_string(), ToolValue::Int(3)),
            ]);
            let kwargs = bridge.kwargs(py, &args).unwrap();

            let data = kwargs.get_item("data").unwrap().unwrap();
            assert!(data.is_instance(&bridge.path_cls).unwrap());
            let count = kwargs.get_item("count").unwrap().unwrap();
            assert_eq!(count.extract::<i64>().unwrap(), 3);
        });
    }
}
