//! Per-type operation tables.
//!
//! Every value type has a static [`TypeOps`] table of optional function
//! pointers. Binary operators dispatch on the left operand's table; a
//! missing entry, or an entry that declines the right operand by returning
//! `None`, raises a `TypeError`.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::error::{Exception, InternalError, OpResult};

use super::heap::Heap;
use super::value::{
    ClassObject, FunctionObject, HeapData, InstanceObject, MapKey, StrObject, Value, ValueMap,
};

pub type BinaryFn = fn(&mut Heap, Value, Value) -> OpResult<Option<Value>>;
pub type UnaryFn = fn(Value) -> OpResult<Option<Value>>;
pub type EqFn = fn(&Heap, Value, Value) -> OpResult<bool>;
pub type CompareFn = fn(&Heap, Compare, Value, Value) -> OpResult<Option<bool>>;
pub type ContainsFn = fn(&Heap, Value, Value) -> OpResult<Option<bool>>;
pub type TruthyFn = fn(&Heap, Value) -> OpResult<bool>;
pub type GetIndexFn = fn(&mut Heap, Value, Value) -> OpResult<Value>;
pub type SetIndexFn = fn(&mut Heap, Value, Value, Value) -> OpResult<()>;
pub type GetAttrFn = fn(&mut Heap, Value, &str) -> OpResult<Option<Value>>;
pub type SetAttrFn = fn(&mut Heap, Value, &str, Value) -> OpResult<()>;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

/// Ordering comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Compare {
    pub fn symbol(self) -> &'static str {
        match self {
            Compare::Lt => "<",
            Compare::Gt => ">",
            Compare::Lte => "<=",
            Compare::Gte => ">=",
        }
    }

    fn holds<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            Compare::Lt => a < b,
            Compare::Gt => a > b,
            Compare::Lte => a <= b,
            Compare::Gte => a >= b,
        }
    }
}

/// Operations supported by one value type.
pub struct TypeOps {
    pub name: &'static str,
    pub add: Option<BinaryFn>,
    pub sub: Option<BinaryFn>,
    pub mul: Option<BinaryFn>,
    pub div: Option<BinaryFn>,
    pub rem: Option<BinaryFn>,
    pub shl: Option<BinaryFn>,
    pub shr: Option<BinaryFn>,
    pub neg: Option<UnaryFn>,
    pub plus: Option<UnaryFn>,
    pub eq: EqFn,
    pub compare: Option<CompareFn>,
    /// Membership test with this value as the container.
    pub contains: Option<ContainsFn>,
    pub truthy: TruthyFn,
    pub get_index: Option<GetIndexFn>,
    pub set_index: Option<SetIndexFn>,
    pub get_attr: Option<GetAttrFn>,
    pub set_attr: Option<SetAttrFn>,
}

const BASE_OPS: TypeOps = TypeOps {
    name: "",
    add: None,
    sub: None,
    mul: None,
    div: None,
    rem: None,
    shl: None,
    shr: None,
    neg: None,
    plus: None,
    eq: identity_eq,
    compare: None,
    contains: None,
    truthy: always_true,
    get_index: None,
    set_index: None,
    get_attr: None,
    set_attr: None,
};

static NULL_OPS: TypeOps = TypeOps {
    name: "null",
    truthy: always_false,
    ..BASE_OPS
};

static BOOL_OPS: TypeOps = TypeOps {
    name: "bool",
    truthy: bool_truthy,
    ..BASE_OPS
};

const NUMBER_OPS: TypeOps = TypeOps {
    add: Some(num_add),
    sub: Some(num_sub),
    mul: Some(num_mul),
    div: Some(num_div),
    rem: Some(num_rem),
    shl: Some(long_shl),
    shr: Some(long_shr),
    neg: Some(num_neg),
    plus: Some(num_plus),
    eq: num_eq,
    compare: Some(num_compare),
    truthy: num_truthy,
    ..BASE_OPS
};

static LONG_OPS: TypeOps = TypeOps {
    name: "long",
    ..NUMBER_OPS
};

static DOUBLE_OPS: TypeOps = TypeOps {
    name: "double",
    shl: None,
    shr: None,
    ..NUMBER_OPS
};

static STRING_OPS: TypeOps = TypeOps {
    name: "string",
    add: Some(str_concat),
    eq: str_eq,
    compare: Some(str_compare),
    contains: Some(str_contains),
    truthy: str_truthy,
    get_index: Some(str_get_index),
    get_attr: Some(str_get_attr),
    ..BASE_OPS
};

static ARRAY_OPS: TypeOps = TypeOps {
    name: "array",
    add: Some(array_concat),
    contains: Some(array_contains),
    truthy: array_truthy,
    get_index: Some(array_get_index),
    set_index: Some(array_set_index),
    get_attr: Some(array_get_attr),
    ..BASE_OPS
};

static MAP_OPS: TypeOps = TypeOps {
    name: "map",
    contains: Some(map_contains),
    truthy: map_truthy,
    get_index: Some(map_get_index),
    set_index: Some(map_set_index),
    get_attr: Some(map_get_attr),
    set_attr: Some(map_set_attr),
    ..BASE_OPS
};

static FUNCTION_OPS: TypeOps = TypeOps {
    name: "function",
    ..BASE_OPS
};

static CLASS_OPS: TypeOps = TypeOps {
    name: "class",
    get_attr: Some(class_get_attr),
    ..BASE_OPS
};

static INSTANCE_OPS: TypeOps = TypeOps {
    name: "instance",
    get_attr: Some(instance_get_attr),
    set_attr: Some(instance_set_attr),
    ..BASE_OPS
};

/// The operation table for `value`'s type.
pub fn type_ops(heap: &Heap, value: Value) -> OpResult<&'static TypeOps> {
    Ok(match value {
        Value::Null => &NULL_OPS,
        Value::Bool(_) => &BOOL_OPS,
        Value::Long(_) => &LONG_OPS,
        Value::Double(_) => &DOUBLE_OPS,
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Str(_) => &STRING_OPS,
            HeapData::Array(_) => &ARRAY_OPS,
            HeapData::Map(_) => &MAP_OPS,
            HeapData::Function(_) => &FUNCTION_OPS,
            HeapData::Class(_) => &CLASS_OPS,
            HeapData::Instance(_) => &INSTANCE_OPS,
        },
    })
}

pub fn type_name(heap: &Heap, value: Value) -> OpResult<&'static str> {
    Ok(type_ops(heap, value)?.name)
}

fn unsupported(heap: &Heap, op: &str, l: Value, r: Value) -> OpResult<Exception> {
    Ok(Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        type_name(heap, l)?,
        type_name(heap, r)?
    )))
}

// --- Dispatch ---

pub fn binary(heap: &mut Heap, op: BinaryOp, l: Value, r: Value) -> OpResult<Value> {
    let ops = type_ops(heap, l)?;
    let entry = match op {
        BinaryOp::Add => ops.add,
        BinaryOp::Sub => ops.sub,
        BinaryOp::Mul => ops.mul,
        BinaryOp::Div => ops.div,
        BinaryOp::Rem => ops.rem,
        BinaryOp::Shl => ops.shl,
        BinaryOp::Shr => ops.shr,
    };
    if let Some(f) = entry {
        if let Some(result) = f(heap, l, r)? {
            return Ok(result);
        }
    }
    Err(unsupported(heap, op.symbol(), l, r)?.into())
}

pub fn negate(heap: &Heap, value: Value) -> OpResult<Value> {
    unary(heap, value, "-", type_ops(heap, value)?.neg)
}

pub fn unary_plus(heap: &Heap, value: Value) -> OpResult<Value> {
    unary(heap, value, "+", type_ops(heap, value)?.plus)
}

fn unary(heap: &Heap, value: Value, symbol: &str, entry: Option<UnaryFn>) -> OpResult<Value> {
    if let Some(f) = entry {
        if let Some(result) = f(value)? {
            return Ok(result);
        }
    }
    Err(Exception::type_error(format!(
        "bad operand type for unary {}: '{}'",
        symbol,
        type_name(heap, value)?
    ))
    .into())
}

pub fn equal(heap: &Heap, l: Value, r: Value) -> OpResult<bool> {
    (type_ops(heap, l)?.eq)(heap, l, r)
}

pub fn compare(heap: &Heap, op: Compare, l: Value, r: Value) -> OpResult<bool> {
    if let Some(f) = type_ops(heap, l)?.compare {
        if let Some(result) = f(heap, op, l, r)? {
            return Ok(result);
        }
    }
    Err(unsupported(heap, op.symbol(), l, r)?.into())
}

/// `item in container`.
pub fn contains(heap: &Heap, item: Value, container: Value) -> OpResult<bool> {
    if let Some(f) = type_ops(heap, container)?.contains {
        if let Some(result) = f(heap, container, item)? {
            return Ok(result);
        }
    }
    Err(unsupported(heap, "in", item, container)?.into())
}

pub fn truthy(heap: &Heap, value: Value) -> OpResult<bool> {
    (type_ops(heap, value)?.truthy)(heap, value)
}

pub fn get_index(heap: &mut Heap, container: Value, index: Value) -> OpResult<Value> {
    match type_ops(heap, container)?.get_index {
        Some(f) => f(heap, container, index),
        None => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            type_name(heap, container)?
        ))
        .into()),
    }
}

pub fn set_index(heap: &mut Heap, container: Value, index: Value, value: Value) -> OpResult<()> {
    match type_ops(heap, container)?.set_index {
        Some(f) => f(heap, container, index, value),
        None => Err(Exception::runtime("illegal indexed assignment").into()),
    }
}

pub fn get_attr(heap: &mut Heap, target: Value, name: &str) -> OpResult<Value> {
    let ops = type_ops(heap, target)?;
    match ops.get_attr {
        Some(f) => match f(heap, target, name)? {
            Some(value) => Ok(value),
            None => Err(Exception::key_error(format!("property '{}' not found", name)).into()),
        },
        None => Err(Exception::type_error(format!(
            "'{}' has no property '{}'",
            ops.name, name
        ))
        .into()),
    }
}

pub fn set_attr(heap: &mut Heap, target: Value, name: &str, value: Value) -> OpResult<()> {
    let ops = type_ops(heap, target)?;
    match ops.set_attr {
        Some(f) => f(heap, target, name, value),
        None => Err(Exception::type_error(format!(
            "cannot set property '{}' on '{}'",
            name, ops.name
        ))
        .into()),
    }
}

// --- Typed accessors ---

fn corrupt(expected: &str) -> InternalError {
    InternalError::Corrupt(format!("expected {} object", expected))
}

pub fn as_str(heap: &Heap, value: Value) -> OpResult<Option<&StrObject>> {
    match value {
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Str(s) => Ok(Some(s)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn str_of(heap: &Heap, value: Value) -> OpResult<&StrObject> {
    as_str(heap, value)?.ok_or_else(|| corrupt("string").into())
}

pub fn as_array(heap: &Heap, value: Value) -> OpResult<Option<&Vec<Value>>> {
    match value {
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Array(items) => Ok(Some(items)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn array_of(heap: &Heap, value: Value) -> OpResult<&Vec<Value>> {
    as_array(heap, value)?.ok_or_else(|| corrupt("array").into())
}

fn array_mut(heap: &mut Heap, value: Value) -> OpResult<&mut Vec<Value>> {
    let id = value.heap_id().ok_or_else(|| corrupt("array"))?;
    match heap.data_mut(id)? {
        HeapData::Array(items) => Ok(items),
        _ => Err(corrupt("array").into()),
    }
}

fn map_of(heap: &Heap, value: Value) -> OpResult<&ValueMap> {
    match value.heap_id().map(|id| heap.data(id)).transpose()? {
        Some(HeapData::Map(map)) => Ok(map),
        _ => Err(corrupt("map").into()),
    }
}

fn map_mut(heap: &mut Heap, value: Value) -> OpResult<&mut ValueMap> {
    let id = value.heap_id().ok_or_else(|| corrupt("map"))?;
    match heap.data_mut(id)? {
        HeapData::Map(map) => Ok(map),
        _ => Err(corrupt("map").into()),
    }
}

pub fn as_class(heap: &Heap, value: Value) -> OpResult<Option<&ClassObject>> {
    match value {
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Class(class) => Ok(Some(class)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

pub fn as_instance(heap: &Heap, value: Value) -> OpResult<Option<&InstanceObject>> {
    match value {
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Instance(instance) => Ok(Some(instance)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

pub fn as_function(heap: &Heap, value: Value) -> OpResult<Option<&FunctionObject>> {
    match value {
        Value::Ref(id) => match heap.data(id)? {
            HeapData::Function(function) => Ok(Some(function)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Convert a value into a map key. Only strings and longs are keys.
pub fn map_key(heap: &Heap, value: Value) -> OpResult<MapKey> {
    match value {
        Value::Long(n) => Ok(MapKey::Long(n)),
        _ => match as_str(heap, value)? {
            Some(s) => Ok(MapKey::Str(s.text.clone())),
            None => Err(Exception::type_error(format!(
                "unhashable type: '{}'",
                type_name(heap, value)?
            ))
            .into()),
        },
    }
}

/// The value form of a map key.
pub fn key_value(heap: &mut Heap, key: &MapKey) -> Value {
    match key {
        MapKey::Long(n) => Value::Long(*n),
        MapKey::Str(s) => Value::Ref(heap.alloc(HeapData::Str(StrObject::new(s.clone())))),
    }
}

// --- Shared entries ---

fn identity_eq(_: &Heap, l: Value, r: Value) -> OpResult<bool> {
    Ok(l == r)
}

fn always_true(_: &Heap, _: Value) -> OpResult<bool> {
    Ok(true)
}

fn always_false(_: &Heap, _: Value) -> OpResult<bool> {
    Ok(false)
}

fn bool_truthy(_: &Heap, value: Value) -> OpResult<bool> {
    Ok(value == Value::Bool(true))
}

// --- Numbers ---

fn overflow() -> Exception {
    Exception::runtime("integer overflow")
}

fn division_by_zero() -> Exception {
    Exception::runtime("division by zero")
}

fn arith(
    l: Value,
    r: Value,
    long_op: fn(i64, i64) -> Result<i64, Exception>,
    double_op: fn(f64, f64) -> f64,
) -> OpResult<Option<Value>> {
    Ok(match (l, r) {
        (Value::Long(a), Value::Long(b)) => Some(Value::Long(long_op(a, b)?)),
        (Value::Long(a), Value::Double(b)) => Some(Value::Double(double_op(a as f64, b))),
        (Value::Double(a), Value::Long(b)) => Some(Value::Double(double_op(a, b as f64))),
        (Value::Double(a), Value::Double(b)) => Some(Value::Double(double_op(a, b))),
        _ => None,
    })
}

fn num_add(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    arith(l, r, |a, b| a.checked_add(b).ok_or_else(overflow), |a, b| a + b)
}

fn num_sub(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    arith(l, r, |a, b| a.checked_sub(b).ok_or_else(overflow), |a, b| a - b)
}

fn num_mul(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    arith(l, r, |a, b| a.checked_mul(b).ok_or_else(overflow), |a, b| a * b)
}

fn num_div(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    arith(
        l,
        r,
        |a, b| {
            if b == 0 {
                return Err(division_by_zero());
            }
            a.checked_div(b).ok_or_else(overflow)
        },
        |a, b| a / b,
    )
}

fn num_rem(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    arith(
        l,
        r,
        |a, b| {
            if b == 0 {
                return Err(division_by_zero());
            }
            a.checked_rem(b).ok_or_else(overflow)
        },
        |a, b| a % b,
    )
}

fn shift_count(count: i64) -> Result<u32, Exception> {
    if (0..64).contains(&count) {
        Ok(count as u32)
    } else {
        Err(Exception::runtime(format!("shift count {} out of range", count)))
    }
}

fn long_shl(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    match (l, r) {
        (Value::Long(a), Value::Long(b)) => Ok(Some(Value::Long(a << shift_count(b)?))),
        _ => Ok(None),
    }
}

fn long_shr(_: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    match (l, r) {
        (Value::Long(a), Value::Long(b)) => Ok(Some(Value::Long(a >> shift_count(b)?))),
        _ => Ok(None),
    }
}

fn num_neg(value: Value) -> OpResult<Option<Value>> {
    match value {
        Value::Long(n) => Ok(Some(Value::Long(n.checked_neg().ok_or_else(overflow)?))),
        Value::Double(d) => Ok(Some(Value::Double(-d))),
        _ => Ok(None),
    }
}

fn num_plus(value: Value) -> OpResult<Option<Value>> {
    Ok(matches!(value, Value::Long(_) | Value::Double(_)).then_some(value))
}

fn as_f64(value: Value) -> Option<f64> {
    match value {
        Value::Long(n) => Some(n as f64),
        Value::Double(d) => Some(d),
        _ => None,
    }
}

fn num_eq(_: &Heap, l: Value, r: Value) -> OpResult<bool> {
    Ok(match (l, r) {
        (Value::Long(a), Value::Long(b)) => a == b,
        _ => match (as_f64(l), as_f64(r)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    })
}

fn num_compare(_: &Heap, op: Compare, l: Value, r: Value) -> OpResult<Option<bool>> {
    Ok(match (l, r) {
        (Value::Long(a), Value::Long(b)) => Some(op.holds(a, b)),
        _ => match (as_f64(l), as_f64(r)) {
            (Some(a), Some(b)) => Some(op.holds(a, b)),
            _ => None,
        },
    })
}

fn num_truthy(_: &Heap, value: Value) -> OpResult<bool> {
    Ok(match value {
        Value::Long(n) => n != 0,
        Value::Double(d) => d != 0.0,
        _ => true,
    })
}

// --- Strings ---

fn str_concat(heap: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    let mut text = str_of(heap, l)?.text.to_string();
    text.push_str(&stringify(heap, r)?);
    Ok(Some(heap.alloc_str(&text)))
}

fn str_eq(heap: &Heap, l: Value, r: Value) -> OpResult<bool> {
    let left = str_of(heap, l)?;
    Ok(match as_str(heap, r)? {
        Some(right) => left.hash == right.hash && left.text == right.text,
        None => false,
    })
}

fn str_compare(heap: &Heap, op: Compare, l: Value, r: Value) -> OpResult<Option<bool>> {
    let left = str_of(heap, l)?;
    Ok(as_str(heap, r)?.map(|right| op.holds(&*left.text, &*right.text)))
}

fn str_contains(heap: &Heap, container: Value, item: Value) -> OpResult<Option<bool>> {
    let haystack = str_of(heap, container)?;
    Ok(as_str(heap, item)?.map(|needle| haystack.text.contains(&*needle.text)))
}

fn str_truthy(heap: &Heap, value: Value) -> OpResult<bool> {
    Ok(!str_of(heap, value)?.is_empty())
}

fn str_get_index(heap: &mut Heap, container: Value, index: Value) -> OpResult<Value> {
    let Value::Long(i) = index else {
        return Err(Exception::type_error(format!(
            "string indices must be longs, not '{}'",
            type_name(heap, index)?
        ))
        .into());
    };
    let ch = usize::try_from(i)
        .ok()
        .and_then(|i| str_of(heap, container).ok()?.text.chars().nth(i));
    match ch {
        Some(ch) => Ok(heap.alloc_str(ch.encode_utf8(&mut [0; 4]))),
        None => Err(Exception::key_error(format!("string index {} out of range", i)).into()),
    }
}

fn str_get_attr(heap: &mut Heap, target: Value, name: &str) -> OpResult<Option<Value>> {
    match name {
        "length" => Ok(Some(Value::Long(str_of(heap, target)?.len() as i64))),
        _ => Ok(None),
    }
}

// --- Arrays ---

fn array_concat(heap: &mut Heap, l: Value, r: Value) -> OpResult<Option<Value>> {
    let Some(right) = as_array(heap, r)? else {
        return Ok(None);
    };
    let mut items = array_of(heap, l)?.clone();
    items.extend_from_slice(right);
    Ok(Some(heap.alloc_array(items)))
}

fn array_contains(heap: &Heap, container: Value, item: Value) -> OpResult<Option<bool>> {
    for element in array_of(heap, container)? {
        if equal(heap, *element, item)? {
            return Ok(Some(true));
        }
    }
    Ok(Some(false))
}

fn array_truthy(heap: &Heap, value: Value) -> OpResult<bool> {
    Ok(!array_of(heap, value)?.is_empty())
}

fn array_index(heap: &Heap, index: Value) -> OpResult<i64> {
    match index {
        Value::Long(i) => Ok(i),
        _ => Err(Exception::type_error(format!(
            "array indices must be longs, not '{}'",
            type_name(heap, index)?
        ))
        .into()),
    }
}

fn out_of_range(i: i64) -> Exception {
    Exception::key_error(format!("index {} out of range", i))
}

fn array_get_index(heap: &mut Heap, container: Value, index: Value) -> OpResult<Value> {
    let i = array_index(heap, index)?;
    usize::try_from(i)
        .ok()
        .and_then(|slot| array_of(heap, container).ok()?.get(slot).copied())
        .ok_or_else(|| out_of_range(i).into())
}

fn array_set_index(heap: &mut Heap, container: Value, index: Value, value: Value) -> OpResult<()> {
    let i = array_index(heap, index)?;
    let items = array_mut(heap, container)?;
    let slot = usize::try_from(i).map_err(|_| out_of_range(i))?;
    let old = if slot < items.len() {
        Some(std::mem::replace(&mut items[slot], value))
    } else if slot == items.len() {
        items.push(value);
        None
    } else {
        return Err(out_of_range(i).into());
    };
    let id = container.heap_id().ok_or_else(|| corrupt("array"))?;
    heap.retarget(id, old, Some(value))?;
    Ok(())
}

fn array_get_attr(heap: &mut Heap, target: Value, name: &str) -> OpResult<Option<Value>> {
    match name {
        "length" => Ok(Some(Value::Long(array_of(heap, target)?.len() as i64))),
        _ => Ok(None),
    }
}

// --- Maps ---

fn map_contains(heap: &Heap, container: Value, item: Value) -> OpResult<Option<bool>> {
    let key = map_key(heap, item)?;
    Ok(Some(map_of(heap, container)?.contains_key(&key)))
}

fn map_truthy(heap: &Heap, value: Value) -> OpResult<bool> {
    Ok(!map_of(heap, value)?.is_empty())
}

fn map_get_index(heap: &mut Heap, container: Value, index: Value) -> OpResult<Value> {
    let key = map_key(heap, index)?;
    map_of(heap, container)?
        .get(&key)
        .copied()
        .ok_or_else(|| Exception::key_error(format!("key {} not found", key)).into())
}

/// Insert or replace `key` in a map, keeping reference counts in step.
pub fn map_insert(heap: &mut Heap, container: Value, key: MapKey, value: Value) -> OpResult<()> {
    let old = map_mut(heap, container)?.insert(key, value);
    let id = container.heap_id().ok_or_else(|| corrupt("map"))?;
    heap.retarget(id, old, Some(value))?;
    Ok(())
}

fn map_set_index(heap: &mut Heap, container: Value, index: Value, value: Value) -> OpResult<()> {
    let key = map_key(heap, index)?;
    map_insert(heap, container, key, value)
}

fn map_get_attr(heap: &mut Heap, target: Value, name: &str) -> OpResult<Option<Value>> {
    let map = map_of(heap, target)?;
    if let Some(value) = map.get(&MapKey::Str(Rc::from(name))) {
        return Ok(Some(*value));
    }
    match name {
        "length" => Ok(Some(Value::Long(map.len() as i64))),
        _ => Ok(None),
    }
}

fn map_set_attr(heap: &mut Heap, target: Value, name: &str, value: Value) -> OpResult<()> {
    map_insert(heap, target, MapKey::Str(Rc::from(name)), value)
}

// --- Classes and instances ---

/// Look `name` up in a class's own members, then along its base chain.
pub fn find_member(heap: &Heap, class: Value, name: &str) -> OpResult<Option<Value>> {
    let mut current = class;
    while let Some(class) = as_class(heap, current)? {
        if let Some(member) = class.members.get(name) {
            return Ok(Some(*member));
        }
        match class.base {
            Some(base) => current = Value::Ref(base),
            None => break,
        }
    }
    Ok(None)
}

fn class_get_attr(heap: &mut Heap, target: Value, name: &str) -> OpResult<Option<Value>> {
    find_member(heap, target, name)
}

/// Walk an instance chain: each level's properties, then its class's own
/// members, then the base level.
pub(crate) fn instance_get_attr(
    heap: &mut Heap,
    target: Value,
    name: &str,
) -> OpResult<Option<Value>> {
    let mut level = Some(target);
    while let Some(current) = level {
        let Some(instance) = as_instance(heap, current)? else {
            break;
        };
        if let Some(value) = instance.properties.get(name) {
            return Ok(Some(*value));
        }
        if let Some(class) = as_class(heap, Value::Ref(instance.class))? {
            if let Some(member) = class.members.get(name) {
                return Ok(Some(*member));
            }
        }
        level = instance.base_instance.map(Value::Ref);
    }
    Ok(None)
}

/// Assign on the level that already holds `name`, or on `target` itself.
fn instance_set_attr(heap: &mut Heap, target: Value, name: &str, value: Value) -> OpResult<()> {
    let mut owner = target;
    let mut level = Some(target);
    while let Some(current) = level {
        let Some(instance) = as_instance(heap, current)? else {
            break;
        };
        if instance.properties.contains_key(name) {
            owner = current;
            break;
        }
        level = instance.base_instance.map(Value::Ref);
    }

    let id = owner.heap_id().ok_or_else(|| corrupt("instance"))?;
    let old = match heap.data_mut(id)? {
        HeapData::Instance(instance) => instance.properties.insert(Rc::from(name), value),
        _ => return Err(corrupt("instance").into()),
    };
    heap.retarget(id, old, Some(value))?;
    Ok(())
}

// --- Builtin methods ---

/// Methods built into strings, arrays and maps. `None` when the receiver's
/// type has no method called `name`.
pub fn call_builtin_method(
    heap: &mut Heap,
    receiver: Value,
    name: &str,
    args: &[Value],
) -> OpResult<Option<Value>> {
    let type_name = type_name(heap, receiver)?;
    let expect = |n: usize| -> OpResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(Exception::wrong_arity(name, n, args.len()).into())
        }
    };
    let result = match (type_name, name) {
        ("array", "push") => {
            expect(1)?;
            let id = receiver.heap_id().ok_or_else(|| corrupt("array"))?;
            array_mut(heap, receiver)?.push(args[0]);
            heap.retarget(id, None, Some(args[0]))?;
            Value::Null
        }
        ("array", "pop") => {
            expect(0)?;
            let id = receiver.heap_id().ok_or_else(|| corrupt("array"))?;
            let popped = array_mut(heap, receiver)?
                .pop()
                .ok_or_else(|| Exception::key_error("pop from empty array"))?;
            heap.retarget(id, Some(popped), None)?;
            popped
        }
        ("map", "keys") => {
            expect(0)?;
            let keys: Vec<MapKey> = map_of(heap, receiver)?.keys().cloned().collect();
            let items = keys.iter().map(|key| key_value(heap, key)).collect();
            heap.alloc_array(items)
        }
        ("map", "remove") => {
            expect(1)?;
            let key = map_key(heap, args[0])?;
            let id = receiver.heap_id().ok_or_else(|| corrupt("map"))?;
            let removed = map_mut(heap, receiver)?
                .shift_remove(&key)
                .ok_or_else(|| Exception::key_error(format!("key {} not found", key)))?;
            heap.retarget(id, Some(removed), None)?;
            removed
        }
        ("string", "length") => {
            expect(0)?;
            Value::Long(str_of(heap, receiver)?.len() as i64)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

// --- Display ---

/// The display form of a value. Strings print raw at the top level and
/// quoted inside containers; containers already being printed show as
/// `[...]` or `{...}`.
pub fn stringify(heap: &Heap, value: Value) -> OpResult<String> {
    let mut out = String::new();
    let mut active = Vec::new();
    write_value(heap, value, false, &mut active, &mut out)?;
    Ok(out)
}

pub fn format_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e16 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}

fn write_value(
    heap: &Heap,
    value: Value,
    quoted: bool,
    active: &mut Vec<Value>,
    out: &mut String,
) -> OpResult<()> {
    let id = match value {
        Value::Null => {
            out.push_str("null");
            return Ok(());
        }
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
            return Ok(());
        }
        Value::Long(n) => {
            let _ = write!(out, "{}", n);
            return Ok(());
        }
        Value::Double(d) => {
            out.push_str(&format_double(d));
            return Ok(());
        }
        Value::Ref(id) => id,
    };

    match heap.data(id)? {
        HeapData::Str(s) if quoted => {
            let _ = write!(out, "{:?}", &*s.text);
        }
        HeapData::Str(s) => out.push_str(&s.text),
        HeapData::Array(items) => {
            if active.contains(&value) {
                out.push_str("[...]");
                return Ok(());
            }
            active.push(value);
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(heap, *item, true, active, out)?;
            }
            out.push(']');
            active.pop();
        }
        HeapData::Map(map) => {
            if active.contains(&value) {
                out.push_str("{...}");
                return Ok(());
            }
            active.push(value);
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", key);
                write_value(heap, *item, true, active, out)?;
            }
            out.push('}');
            active.pop();
        }
        HeapData::Function(FunctionObject::Native(native)) => {
            let _ = write!(out, "<native function {}>", native.name);
        }
        HeapData::Function(function) => {
            let _ = write!(out, "<function {}>", function.name());
        }
        HeapData::Class(class) => {
            let _ = write!(out, "<class {}>", class.name);
        }
        HeapData::Instance(instance) => match as_class(heap, Value::Ref(instance.class))? {
            Some(class) => {
                let _ = write!(out, "<{} instance>", class.name);
            }
            None => out.push_str("<instance>"),
        },
    }
    Ok(())
}
