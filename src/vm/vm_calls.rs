//! Function call dispatch for the VM.

use std::rc::Rc;

use crate::error::{Exception, InternalError, OpResult};

use super::chunk::FunctionDef;
use super::frame::{Frame, FrameKind};
use super::natives::{NativeContext, NativeFn};
use super::ops;
use super::value::{FunctionObject, HeapData, MapKey, Value};
use super::vm::{Flow, Vm};

/// What a callee resolved to, detached from the heap borrow.
enum Callee {
    Native(NativeFn),
    Lang { def: Rc<FunctionDef>, unit: usize },
    Class,
}

impl Vm {
    /// `CALL argc`: the callee sits below its arguments.
    pub(crate) fn call_value(&mut self, argc: usize) -> OpResult<Flow> {
        let args = self.current()?.pop_n(argc)?;
        let callee = self.pop()?;
        self.invoke(callee, None, args)
    }

    /// `CALL_METHOD name argc`: the receiver sits below the arguments.
    pub(crate) fn call_method(&mut self, symbol: u16, argc: usize) -> OpResult<Flow> {
        let name = self.symbol(symbol)?;
        let args = self.current()?.pop_n(argc)?;
        let receiver = self.pop()?;

        match ops::type_name(&self.heap, receiver)? {
            "instance" => {
                let Some(method) = ops::instance_get_attr(&mut self.heap, receiver, &name)? else {
                    return Err(self.no_method(receiver, &name)?.into());
                };
                self.invoke(method, Some(receiver), args)
            }
            "class" => {
                let Some(member) = ops::find_member(&self.heap, receiver, &name)? else {
                    return Err(self.no_method(receiver, &name)?.into());
                };
                self.invoke(member, None, args)
            }
            type_name => {
                // Map entries (module functions) shadow the builtin methods.
                if type_name == "map" {
                    let key = MapKey::Str(name.clone());
                    let entry = match receiver.heap_id().map(|id| self.heap.data(id)).transpose()? {
                        Some(HeapData::Map(map)) => map.get(&key).copied(),
                        _ => None,
                    };
                    if let Some(function) = entry {
                        return self.invoke(function, None, args);
                    }
                }
                match ops::call_builtin_method(&mut self.heap, receiver, &name, &args)? {
                    Some(result) => {
                        self.push(result)?;
                        Ok(Flow::Next)
                    }
                    None => Err(Exception::type_error(format!(
                        "'{}' object has no method '{}'",
                        type_name, name
                    ))
                    .into()),
                }
            }
        }
    }

    /// `TypeError` for a method call on an instance or class that has no
    /// member called `name`.
    fn no_method(&self, receiver: Value, name: &str) -> OpResult<Exception> {
        let class = match ops::as_instance(&self.heap, receiver)? {
            Some(instance) => Value::Ref(instance.class),
            None => receiver,
        };
        let class_name = ops::as_class(&self.heap, class)?
            .map(|class| class.name.to_string())
            .ok_or_else(|| InternalError::Corrupt("receiver without a class".into()))?;
        Ok(Exception::type_error(format!(
            "'{}' object has no method '{}'",
            class_name, name
        )))
    }

    /// Call `callee` with `args`. `receiver` becomes `self` when the callee
    /// is a method.
    pub(crate) fn invoke(
        &mut self,
        callee: Value,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> OpResult<Flow> {
        let resolved = match callee.heap_id().map(|id| self.heap.data(id)).transpose()? {
            Some(HeapData::Function(FunctionObject::Native(native))) => Callee::Native(native.func),
            Some(HeapData::Function(FunctionObject::Lang { def, unit })) => Callee::Lang {
                def: def.clone(),
                unit: *unit,
            },
            Some(HeapData::Class(_)) => Callee::Class,
            _ => {
                return Err(Exception::type_error(format!(
                    "'{}' object is not callable",
                    ops::type_name(&self.heap, callee)?
                ))
                .into())
            }
        };

        match resolved {
            Callee::Native(func) => {
                let result = self.call_native(func, args)?;
                self.push(result)?;
                Ok(Flow::Next)
            }
            Callee::Lang { def, .. } if def.is_constructor => Err(Exception::invalid_operation(
                "a constructor cannot be called directly",
            )
            .into()),
            Callee::Lang { def, unit } => {
                let self_value = if def.is_method {
                    Some(receiver.ok_or_else(|| {
                        Exception::runtime(format!("method '{}' called without an instance", def.name))
                    })?)
                } else {
                    None
                };
                let frame = self.enter_function(def, unit, FrameKind::Function, self_value, args)?;
                Ok(Flow::Call(frame))
            }
            Callee::Class => self.construct(callee, args),
        }
    }

    /// Build the frame for a language function: check the depth limit and
    /// the arity, then bind the parameters.
    pub(crate) fn enter_function(
        &mut self,
        def: Rc<FunctionDef>,
        unit: usize,
        kind: FrameKind,
        self_value: Option<Value>,
        mut args: Vec<Value>,
    ) -> OpResult<Frame> {
        if self.frames.len() >= self.config.max_frames {
            tracing::warn!(
                target: "marrow::vm",
                max_frames = self.config.max_frames,
                function = %def.name,
                "call depth limit reached"
            );
            return Err(Exception::runtime("maximum call depth exceeded").into());
        }
        if !def.accepts(args.len()) {
            let required = def.required_params();
            let err = if def.has_rest() {
                Exception::argument(format!(
                    "{}() expects at least {} argument{}, got {}",
                    def.name,
                    required,
                    if required == 1 { "" } else { "s" },
                    args.len()
                ))
            } else {
                Exception::wrong_arity(&def.name, required, args.len())
            };
            return Err(err.into());
        }

        let mut frame = Frame::new(def.clone(), unit, kind);
        frame.self_value = self_value;
        if def.has_rest() {
            let rest = args.split_off(def.required_params());
            args.push(self.heap.alloc_array(rest));
        }
        for (param, value) in def.params.iter().zip(args) {
            self.heap.inc_ref(value)?;
            frame.locals.insert(param.name.clone(), value);
        }
        Ok(frame)
    }

    /// Run a native with its arguments packed into an array.
    pub(crate) fn call_native(&mut self, func: NativeFn, args: Vec<Value>) -> OpResult<Value> {
        let packed = self.heap.alloc_array(args);
        let packed = packed
            .heap_id()
            .ok_or_else(|| InternalError::Corrupt("argument array".into()))?;
        let mut ctx = NativeContext {
            heap: &mut self.heap,
            output: &mut *self.output,
            input: &mut *self.input,
        };
        func(&mut ctx, packed)
    }
}
