//! Conversion from decoded operands to ISIL operands for the load/store
//! architectures, where addressing modes may update the base register.

use crate::core::instruction::{Operand, OperandKind};
use crate::isil::{IsilBuilder, IsilMemoryOperand, IsilOpcode, IsilOperand};

/// Convert one decoded operand. `normalize` maps register aliases onto the
/// canonical names used in ISIL.
pub(crate) fn convert(op: &Operand, normalize: fn(&str) -> String) -> Option<IsilOperand> {
    match op.kind {
        OperandKind::Register => op
            .register
            .as_deref()
            .map(|r| IsilOperand::Register(normalize(r))),
        OperandKind::Immediate => op.immediate.map(IsilOperand::Immediate),
        OperandKind::Memory => {
            let disp = op.displacement.unwrap_or(0);
            let base = op.base.as_deref().map(normalize);
            let index = op.index.as_deref().map(normalize);
            Some(match (base, index) {
                (Some(b), None) if b == "sp" => IsilOperand::Stack(disp),
                (base, index) => IsilOperand::Memory(IsilMemoryOperand {
                    base,
                    index,
                    scale: op.scale.unwrap_or(1),
                    addend: disp,
                }),
            })
        }
    }
}

/// Displace a memory-like operand by `delta` bytes.
pub(crate) fn displaced(op: &IsilOperand, delta: i64) -> IsilOperand {
    match op {
        IsilOperand::Stack(off) => IsilOperand::Stack(off + delta),
        IsilOperand::Memory(m) => IsilOperand::Memory(m.offset_by(delta)),
        other => other.clone(),
    }
}

/// A memory access together with any base register update.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Addressing {
    /// Operand to access, already adjusted for pre-indexing
    pub mem: IsilOperand,
    /// `(base, delta)` applied to the base register
    pub update: Option<(String, i64)>,
    /// The update happens before the access
    pub pre_index: bool,
}

impl Addressing {
    /// Locate the memory operand in `ops` and decode its indexing mode.
    /// Pre-index forms carry the writeback flag on the memory operand;
    /// post-index forms carry a trailing immediate.
    pub(crate) fn from_operands(ops: &[Operand], normalize: fn(&str) -> String) -> Option<Self> {
        let at = ops.iter().position(|o| o.kind == OperandKind::Memory)?;
        let op = &ops[at];
        let mem = convert(op, normalize)?;
        let base = op.base.as_deref().map(normalize);

        if op.writeback {
            let delta = op.displacement.unwrap_or(0);
            return Some(Self {
                mem: displaced(&mem, -delta),
                update: base.map(|b| (b, delta)),
                pre_index: true,
            });
        }
        let post = ops
            .get(at + 1)
            .filter(|o| o.kind == OperandKind::Immediate)
            .and_then(|o| o.immediate);
        Some(Self {
            mem,
            update: post.and_then(|delta| base.map(|b| (b, delta))),
            pre_index: false,
        })
    }

    pub(crate) fn emit_pre(&self, b: &mut IsilBuilder) {
        if self.pre_index {
            self.emit_update(b);
        }
    }

    pub(crate) fn emit_post(&self, b: &mut IsilBuilder) {
        if !self.pre_index {
            self.emit_update(b);
        }
    }

    fn emit_update(&self, b: &mut IsilBuilder) {
        match &self.update {
            Some((base, delta)) if base == "sp" => b.shift_stack(*delta),
            Some((base, delta)) => b.binary(
                IsilOpcode::Add,
                IsilOperand::reg(base.as_str()),
                IsilOperand::reg(base.as_str()),
                IsilOperand::imm(*delta),
            ),
            None => {}
        }
    }
}
