//! Conditional checks and in-place updates (microops) over structured
//! attribute vectors. Pure functions: the caller owns the old value, the
//! applier returns a fresh one.

use bytes::Bytes;

use norn_types::{AttrType, Schema};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroError {
    #[error("malformed attribute encoding")]
    Malformed,
    #[error("operand type does not match the attribute")]
    WrongType,
    #[error("action is not applicable to this attribute type")]
    WrongAction,
    #[error("arithmetic overflow")]
    Overflow,
}

/// One primitive in-place update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroAction {
    Set,
    StringAppend,
    StringPrepend,
    NumAdd,
    NumSub,
    NumMul,
    NumDiv,
    NumMod,
    NumAnd,
    NumOr,
    NumXor,
}

/// Equality condition over one attribute; a failed check aborts the whole
/// request with no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroCheck {
    /// Attribute index; 0 is the key and cannot be checked.
    pub attr: u16,
    pub datatype: AttrType,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroOp {
    /// Attribute index; 0 is the key and cannot be updated.
    pub attr: u16,
    pub action: MicroAction,
    pub datatype: AttrType,
    pub arg: Bytes,
}

/// Outcome of applying a request's checks and ops.
///
/// `passed` counts how many checks and ops succeeded, in order; the request
/// took effect only when `passed == checks.len() + ops.len()` and `error` is
/// `None`. A short count with no error is a failed comparison.
#[derive(Debug, Clone)]
pub struct Applied {
    pub value: Vec<Bytes>,
    pub passed: usize,
    pub error: Option<MicroError>,
}

/// Does `bytes` parse as `ty`?
pub fn validate_as_type(bytes: &[u8], ty: AttrType) -> bool {
    match ty {
        AttrType::String => true,
        AttrType::Int | AttrType::Float => bytes.is_empty() || bytes.len() == 8,
    }
}

fn decode_int(bytes: &[u8]) -> Result<i64, MicroError> {
    match bytes.len() {
        0 => Ok(0),
        8 => Ok(i64::from_le_bytes(bytes.try_into().expect("8 byte slice"))),
        _ => Err(MicroError::Malformed),
    }
}

fn decode_float(bytes: &[u8]) -> Result<f64, MicroError> {
    match bytes.len() {
        0 => Ok(0.0),
        8 => Ok(f64::from_le_bytes(bytes.try_into().expect("8 byte slice"))),
        _ => Err(MicroError::Malformed),
    }
}

fn encode_int(v: i64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

fn encode_float(v: f64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

/// Attribute equality under the declared type. Numeric attributes compare by
/// value so that the empty encoding equals an explicit zero.
fn check_passes(current: &[u8], check: &MicroCheck) -> Result<bool, MicroError> {
    match check.datatype {
        AttrType::String => Ok(current == check.value.as_ref()),
        AttrType::Int => Ok(decode_int(current)? == decode_int(&check.value)?),
        AttrType::Float => Ok(decode_float(current)? == decode_float(&check.value)?),
    }
}

fn apply_int(old: i64, action: MicroAction, arg: i64) -> Result<i64, MicroError> {
    let out = match action {
        MicroAction::NumAdd => old.checked_add(arg),
        MicroAction::NumSub => old.checked_sub(arg),
        MicroAction::NumMul => old.checked_mul(arg),
        MicroAction::NumDiv => old.checked_div(arg),
        MicroAction::NumMod => old.checked_rem(arg),
        MicroAction::NumAnd => Some(old & arg),
        MicroAction::NumOr => Some(old | arg),
        MicroAction::NumXor => Some(old ^ arg),
        _ => return Err(MicroError::WrongAction),
    };
    out.ok_or(MicroError::Overflow)
}

fn apply_float(old: f64, action: MicroAction, arg: f64) -> Result<f64, MicroError> {
    let out = match action {
        MicroAction::NumAdd => old + arg,
        MicroAction::NumSub => old - arg,
        MicroAction::NumMul => old * arg,
        MicroAction::NumDiv => old / arg,
        _ => return Err(MicroError::WrongAction),
    };
    if out.is_finite() {
        Ok(out)
    } else {
        Err(MicroError::Overflow)
    }
}

fn apply_one(current: &Bytes, op: &MicroOp) -> Result<Bytes, MicroError> {
    if op.action == MicroAction::Set {
        if !validate_as_type(&op.arg, op.datatype) {
            return Err(MicroError::Malformed);
        }
        return Ok(op.arg.clone());
    }

    match op.datatype {
        AttrType::String => match op.action {
            MicroAction::StringAppend => {
                let mut out = Vec::with_capacity(current.len() + op.arg.len());
                out.extend_from_slice(current);
                out.extend_from_slice(&op.arg);
                Ok(Bytes::from(out))
            }
            MicroAction::StringPrepend => {
                let mut out = Vec::with_capacity(current.len() + op.arg.len());
                out.extend_from_slice(&op.arg);
                out.extend_from_slice(current);
                Ok(Bytes::from(out))
            }
            _ => Err(MicroError::WrongAction),
        },
        AttrType::Int => {
            let old = decode_int(current)?;
            let arg = decode_int(&op.arg)?;
            Ok(encode_int(apply_int(old, op.action, arg)?))
        }
        AttrType::Float => {
            let old = decode_float(current)?;
            let arg = decode_float(&op.arg)?;
            Ok(encode_float(apply_float(old, op.action, arg)?))
        }
    }
}

/// Evaluate `checks` then apply `ops` against `old_value`, producing the new
/// attribute vector. `old_value` must already be sized to the schema's value
/// arity (absent attributes as empty slices). The key is never modified.
pub fn apply_checks_and_ops(
    schema: &Schema,
    checks: &[MicroCheck],
    ops: &[MicroOp],
    old_value: &[Bytes],
) -> Applied {
    debug_assert_eq!(old_value.len(), schema.value_arity());

    let mut value: Vec<Bytes> = old_value.to_vec();
    let mut passed = 0;

    let fail = |value: Vec<Bytes>, passed: usize, error: Option<MicroError>| Applied {
        value,
        passed,
        error,
    };

    for check in checks {
        let idx = check.attr as usize;
        if idx == 0 || idx >= schema.attrs.len() {
            return fail(value, passed, Some(MicroError::WrongType));
        }
        if schema.attrs[idx] != check.datatype {
            return fail(value, passed, Some(MicroError::WrongType));
        }
        match check_passes(&value[idx - 1], check) {
            Ok(true) => passed += 1,
            Ok(false) => return fail(value, passed, None),
            Err(e) => return fail(value, passed, Some(e)),
        }
    }

    for op in ops {
        let idx = op.attr as usize;
        if idx == 0 || idx >= schema.attrs.len() {
            return fail(value, passed, Some(MicroError::WrongType));
        }
        if schema.attrs[idx] != op.datatype {
            return fail(value, passed, Some(MicroError::WrongType));
        }
        match apply_one(&value[idx - 1], op) {
            Ok(new) => {
                value[idx - 1] = new;
                passed += 1;
            }
            Err(e) => return fail(value, passed, Some(e)),
        }
    }

    Applied { value, passed, error: None }
}
