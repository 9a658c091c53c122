//! A small evaluation engine for module images.
//!
//! Interprets the supported instruction subset against an image, with host
//! functions standing in for members imported from other modules and a
//! runtime type registry modeling the late-binding intrinsics the bootstrap
//! wrapper relies on. Exception semantics follow the handler tables: a value
//! raised by `throw` or by a host function unwinds to the innermost catch
//! clause whose try region covers the faulting instruction.
//!
//! This exists to make patched behavior observable in tests - invoking a
//! patched method and asserting on what the hook saw - not to run a game.

use std::collections::HashMap;

use crate::cil::{InstrId, Op, SigLookup};
use crate::image::token::table;
use crate::image::{AssemblyImage, MethodHandle, Token, TypeSig};
use crate::patch::{INVOKE_STATIC_METHOD, LATE_BINDING_TYPE, RESOLVE_TYPE_METHOD};
use crate::{Error, Result};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null reference
    Null,
    /// 32-bit integer (also carries booleans)
    I32(i32),
    /// 32-bit float
    F32(f32),
    /// String
    Str(String),
    /// Heap object handle
    Obj(usize),
}

impl Value {
    /// Branch truth: null and zero are false, everything else true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(v) => *v != 0,
            Value::F32(v) => *v != 0.0,
            Value::Str(_) | Value::Obj(_) => true,
        }
    }

    /// The string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// External function: receives the popped arguments (including `this` for
/// instance members), returns a value or raises.
pub type HostFn = Box<dyn FnMut(Vec<Value>) -> std::result::Result<Value, String>>;

enum ExecError {
    /// A raised exception value, catchable by handler clauses
    Thrown(Value),
    /// Machine-level fault (invalid body, fuel exhaustion); never catchable
    Fault(String),
}

/// Instruction budget for one top-level invocation.
pub const DEFAULT_FUEL: u64 = 1_000_000;

/// The interpreter.
pub struct Machine<'a> {
    image: &'a AssemblyImage,
    statics: HashMap<Token, Value>,
    objects: Vec<HashMap<Token, Value>>,
    externals: HashMap<(String, String), HostFn>,
    runtime_types: HashMap<String, HashMap<String, HostFn>>,
    fuel: u64,
}

impl<'a> Machine<'a> {
    /// A machine over `image` with empty state.
    #[must_use]
    pub fn new(image: &'a AssemblyImage) -> Machine<'a> {
        Machine {
            image,
            statics: HashMap::new(),
            objects: Vec::new(),
            externals: HashMap::new(),
            runtime_types: HashMap::new(),
            fuel: DEFAULT_FUEL,
        }
    }

    /// Provide the implementation of an imported member.
    pub fn register_external(
        &mut self,
        type_full_name: &str,
        method_name: &str,
        f: impl FnMut(Vec<Value>) -> std::result::Result<Value, String> + 'static,
    ) {
        self.externals.insert(
            (type_full_name.to_string(), method_name.to_string()),
            Box::new(f),
        );
    }

    /// Register a type discoverable by the late-binding `ResolveType`
    /// intrinsic, with one invokable static method.
    pub fn register_runtime_type(
        &mut self,
        type_name: &str,
        method_name: &str,
        f: impl FnMut(Vec<Value>) -> std::result::Result<Value, String> + 'static,
    ) {
        self.runtime_types
            .entry(type_name.to_string())
            .or_default()
            .insert(method_name.to_string(), Box::new(f));
    }

    /// Allocate a fresh heap object.
    pub fn new_object(&mut self) -> Value {
        self.objects.push(HashMap::new());
        Value::Obj(self.objects.len() - 1)
    }

    /// Read an instance field of a heap object.
    #[must_use]
    pub fn object_field(&self, object: &Value, field: Token) -> Option<Value> {
        match object {
            Value::Obj(handle) => self.objects.get(*handle)?.get(&field).cloned(),
            _ => None,
        }
    }

    /// Read a static field by declaring type and field name.
    #[must_use]
    pub fn static_field(&self, type_name: &str, field_name: &str) -> Option<Value> {
        let type_index = self.image.type_index(type_name)?;
        let field_index = self.image.types[type_index]
            .fields
            .iter()
            .position(|f| f.name == field_name)?;
        let token = self.image.field_token(type_index, field_index);
        self.statics.get(&token).cloned()
    }

    /// Invoke a method by declaring-type and method name.
    ///
    /// `this` must be provided for instance methods and omitted for static
    /// ones; `args` are the declared parameters in order.
    ///
    /// # Errors
    /// [`Error::Evaluation`] for unhandled exceptions, invalid bodies, or
    /// fuel exhaustion.
    pub fn invoke(
        &mut self,
        type_name: &str,
        method_name: &str,
        this: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let type_index = self
            .image
            .type_index(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        let method_index = self.image.types[type_index]
            .methods
            .iter()
            .position(|m| m.name == method_name)
            .ok_or_else(|| Error::MethodNotFound {
                type_name: type_name.to_string(),
                method_name: method_name.to_string(),
            })?;
        let handle = MethodHandle {
            type_index,
            method_index,
        };

        let has_this = self.image.method(handle).signature.has_this;
        let mut frame_args = Vec::with_capacity(args.len() + 1);
        match (has_this, this) {
            (true, Some(receiver)) => frame_args.push(receiver),
            (true, None) => {
                return Err(Error::Evaluation(format!(
                    "{type_name}.{method_name} is an instance method; a receiver is required"
                )))
            }
            (false, _) => {}
        }
        frame_args.extend(args);

        self.fuel = DEFAULT_FUEL;
        match self.exec(handle, frame_args) {
            Ok(value) => Ok(value),
            Err(ExecError::Thrown(value)) => Err(Error::Evaluation(format!(
                "unhandled exception: {value:?}"
            ))),
            Err(ExecError::Fault(message)) => Err(Error::Evaluation(message)),
        }
    }

    fn exec(
        &mut self,
        handle: MethodHandle,
        mut args: Vec<Value>,
    ) -> std::result::Result<Value, ExecError> {
        let method = self.image.method(handle).clone();
        let display = self.image.method_display(handle);
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| ExecError::Fault(format!("{display} has no body")))?;

        let index_of: HashMap<InstrId, usize> = body
            .instructions
            .iter()
            .enumerate()
            .map(|(idx, i)| (i.id, idx))
            .collect();
        let resolve = |id: InstrId| -> std::result::Result<usize, ExecError> {
            index_of
                .get(&id)
                .copied()
                .ok_or_else(|| ExecError::Fault(format!("{display}: dangling branch target")))
        };

        // Catch clauses resolved to index ranges for unwinding.
        let mut catches: Vec<(usize, usize, usize)> = Vec::new(); // (try_start, try_end, handler_start)
        for handler in &body.exception_handlers {
            if !handler.is_catch() {
                continue;
            }
            let try_start = resolve(handler.try_start)?;
            let try_end = match handler.try_end {
                Some(id) => resolve(id)?,
                None => body.instructions.len(),
            };
            catches.push((try_start, try_end, resolve(handler.handler_start)?));
        }

        let mut locals: Vec<Value> = body.locals.iter().map(default_value).collect();
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;

        macro_rules! pop {
            () => {
                stack
                    .pop()
                    .ok_or_else(|| ExecError::Fault(format!("{display}: stack underflow")))?
            };
        }

        loop {
            if self.fuel == 0 {
                return Err(ExecError::Fault(format!("{display}: fuel exhausted")));
            }
            self.fuel -= 1;

            let instr = body
                .instructions
                .at(pc)
                .ok_or_else(|| ExecError::Fault(format!("{display}: fell off method end")))?;

            let raised: Option<Value> = match &instr.op {
                Op::Nop => None,
                Op::Ldarg(n) => {
                    let value = args
                        .get(*n as usize)
                        .cloned()
                        .ok_or_else(|| ExecError::Fault(format!("{display}: bad arg {n}")))?;
                    stack.push(value);
                    None
                }
                Op::Starg(n) => {
                    let value = pop!();
                    let slot = args
                        .get_mut(*n as usize)
                        .ok_or_else(|| ExecError::Fault(format!("{display}: bad arg {n}")))?;
                    *slot = value;
                    None
                }
                Op::Ldloc(n) => {
                    let value = locals
                        .get(*n as usize)
                        .cloned()
                        .ok_or_else(|| ExecError::Fault(format!("{display}: bad local {n}")))?;
                    stack.push(value);
                    None
                }
                Op::Stloc(n) => {
                    let value = pop!();
                    let slot = locals
                        .get_mut(*n as usize)
                        .ok_or_else(|| ExecError::Fault(format!("{display}: bad local {n}")))?;
                    *slot = value;
                    None
                }
                Op::LdcI4(v) => {
                    stack.push(Value::I32(*v));
                    None
                }
                Op::LdcR4(v) => {
                    stack.push(Value::F32(*v));
                    None
                }
                Op::Ldnull => {
                    stack.push(Value::Null);
                    None
                }
                Op::Ldstr(s) => {
                    stack.push(Value::Str(s.clone()));
                    None
                }
                Op::Dup => {
                    let top = pop!();
                    stack.push(top.clone());
                    stack.push(top);
                    None
                }
                Op::Pop => {
                    pop!();
                    None
                }
                Op::Ldfld(token) => {
                    let receiver = pop!();
                    match receiver {
                        Value::Obj(h) => {
                            let value = self
                                .objects
                                .get(h)
                                .and_then(|o| o.get(token).cloned())
                                .unwrap_or_else(|| {
                                    self.image
                                        .field_type(*token)
                                        .as_ref()
                                        .map_or(Value::Null, default_value)
                                });
                            stack.push(value);
                            None
                        }
                        Value::Null => Some(Value::Str("NullReferenceException".into())),
                        _ => {
                            return Err(ExecError::Fault(format!(
                                "{display}: ldfld on a non-object"
                            )))
                        }
                    }
                }
                Op::Stfld(token) => {
                    let value = pop!();
                    let receiver = pop!();
                    match receiver {
                        Value::Obj(h) => {
                            self.objects
                                .get_mut(h)
                                .ok_or_else(|| {
                                    ExecError::Fault(format!("{display}: bad object handle"))
                                })?
                                .insert(*token, value);
                            None
                        }
                        Value::Null => Some(Value::Str("NullReferenceException".into())),
                        _ => {
                            return Err(ExecError::Fault(format!(
                                "{display}: stfld on a non-object"
                            )))
                        }
                    }
                }
                Op::Ldsfld(token) => {
                    let value = self.statics.get(token).cloned().unwrap_or_else(|| {
                        self.image
                            .field_type(*token)
                            .as_ref()
                            .map_or(Value::Null, default_value)
                    });
                    stack.push(value);
                    None
                }
                Op::Stsfld(token) => {
                    let value = pop!();
                    self.statics.insert(*token, value);
                    None
                }
                Op::Br(target) => {
                    pc = resolve(*target)?;
                    continue;
                }
                Op::Brtrue(target) => {
                    if pop!().is_truthy() {
                        pc = resolve(*target)?;
                        continue;
                    }
                    None
                }
                Op::Brfalse(target) => {
                    if !pop!().is_truthy() {
                        pc = resolve(*target)?;
                        continue;
                    }
                    None
                }
                Op::Leave(target) => {
                    stack.clear();
                    pc = resolve(*target)?;
                    continue;
                }
                Op::Ret => {
                    return if method.signature.returns_value() {
                        Ok(pop!())
                    } else {
                        Ok(Value::Null)
                    };
                }
                Op::Throw => Some(pop!()),
                Op::Call(token) | Op::Callvirt(token) => {
                    match self.dispatch(*token, &mut stack, &display)? {
                        Ok(()) => None,
                        Err(value) => Some(value),
                    }
                }
            };

            if let Some(exception) = raised {
                // Unwind to the innermost catch clause covering this pc.
                let clause = catches
                    .iter()
                    .filter(|(start, end, _)| pc >= *start && pc < *end)
                    .min_by_key(|(start, end, _)| end - start);
                match clause {
                    Some(&(_, _, handler_start)) => {
                        stack.clear();
                        stack.push(exception);
                        pc = handler_start;
                        continue;
                    }
                    None => return Err(ExecError::Thrown(exception)),
                }
            }

            pc += 1;
        }
    }

    /// Dispatch a call: MethodDef tokens execute in the image, MemberRef
    /// tokens go to late-binding intrinsics or registered externals.
    /// Returns `Ok(Err(value))` for a raised exception.
    fn dispatch(
        &mut self,
        token: Token,
        stack: &mut Vec<Value>,
        display: &str,
    ) -> std::result::Result<std::result::Result<(), Value>, ExecError> {
        let sig = self
            .image
            .method_sig(token)
            .ok_or_else(|| ExecError::Fault(format!("{display}: call target {token} unknown")))?;

        let slots = sig.arg_slots();
        if stack.len() < slots {
            return Err(ExecError::Fault(format!(
                "{display}: stack underflow calling {token}"
            )));
        }
        let args: Vec<Value> = stack.split_off(stack.len() - slots);

        let result: std::result::Result<Value, Value> = match token.table() {
            table::METHOD_DEF => {
                let callee = self
                    .image
                    .method_handle(token)
                    .ok_or_else(|| ExecError::Fault(format!("{display}: bad method token")))?;
                match self.exec(callee, args) {
                    Ok(value) => Ok(value),
                    Err(ExecError::Thrown(value)) => Err(value),
                    Err(fault) => return Err(fault),
                }
            }
            table::MEMBER_REF => {
                let (declaring, name) = self
                    .image
                    .callable_names(token)
                    .map(|(d, n)| (d.to_string(), n.to_string()))
                    .ok_or_else(|| ExecError::Fault(format!("{display}: bad member ref")))?;
                self.call_external(&declaring, &name, args)
            }
            _ => {
                return Err(ExecError::Fault(format!(
                    "{display}: call target {token} is not callable"
                )))
            }
        };

        Ok(match result {
            Ok(value) => {
                if sig.returns_value() {
                    stack.push(value);
                }
                Ok(())
            }
            Err(exception) => Err(exception),
        })
    }

    fn call_external(
        &mut self,
        declaring: &str,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, Value> {
        // Late-binding intrinsics are built in; they are what the bootstrap
        // wrapper's injected code calls.
        if declaring == LATE_BINDING_TYPE {
            if name == RESOLVE_TYPE_METHOD {
                let type_name = match args.first().and_then(Value::as_str) {
                    Some(s) => s.to_string(),
                    None => return Err(Value::Str("ArgumentException".into())),
                };
                return if self.runtime_types.contains_key(&type_name) {
                    Ok(Value::Str(type_name))
                } else {
                    Err(Value::Str(format!("TypeLoadException: {type_name}")))
                };
            }
            if name == INVOKE_STATIC_METHOD {
                let (type_handle, method_name) = match (args.first(), args.get(1)) {
                    (Some(Value::Str(t)), Some(Value::Str(m))) => (t.clone(), m.clone()),
                    _ => return Err(Value::Str("ArgumentException".into())),
                };
                let f = self
                    .runtime_types
                    .get_mut(&type_handle)
                    .and_then(|methods| methods.get_mut(&method_name));
                return match f {
                    Some(f) => f(Vec::new()).map_err(Value::Str),
                    None => Err(Value::Str(format!(
                        "MissingMethodException: {type_handle}.{method_name}"
                    ))),
                };
            }
        }

        match self
            .externals
            .get_mut(&(declaring.to_string(), name.to_string()))
        {
            Some(f) => f(args).map_err(Value::Str),
            None => Err(Value::Str(format!(
                "MissingMethodException: {declaring}::{name}"
            ))),
        }
    }
}

fn default_value(sig: &TypeSig) -> Value {
    match sig {
        TypeSig::Boolean | TypeSig::I4 => Value::I32(0),
        TypeSig::R4 => Value::F32(0.0),
        _ => Value::Null,
    }
}
