//! Instruction-level view of a `Code` attribute.
//!
//! Branch targets are kept as labels, which are the original byte offsets of
//! the instructions they point at. Rewriting produces one [`Block`] per
//! original instruction and [`assemble`] lays the blocks out again, widening
//! instructions where the new layout requires it.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::classfile::reader::{read_u16, read_u32, read_u8};
use crate::classfile::writer::{push_u16, push_u32};
use crate::opcodes;

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Insn {
    /// Opcode without operands.
    Simple(u8),
    /// Typed local load/store or `ret`; encoded with `wide` when needed.
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    Bipush(i8),
    Sipush(i16),
    /// `ldc` or `ldc_w`, chosen by the index.
    Ldc(u16),
    Ldc2(u16),
    /// Instruction whose single operand is a constant pool index.
    Indexed { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic(u16),
    NewArray(u8),
    MultiANewArray { index: u16, dimensions: u8 },
    /// Branch to a label. `goto_w`/`jsr_w` decode to `goto`/`jsr`.
    Jump { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

impl Insn {
    pub(crate) fn opcode(&self) -> u8 {
        match self {
            Insn::Simple(opcode) | Insn::Local { opcode, .. } | Insn::Indexed { opcode, .. } => {
                *opcode
            }
            Insn::Jump { opcode, .. } => *opcode,
            Insn::Iinc { .. } => opcodes::IINC,
            Insn::Bipush(_) => opcodes::BIPUSH,
            Insn::Sipush(_) => opcodes::SIPUSH,
            Insn::Ldc(index) => {
                if *index > u8::MAX as u16 {
                    opcodes::LDC_W
                } else {
                    opcodes::LDC
                }
            }
            Insn::Ldc2(_) => opcodes::LDC2_W,
            Insn::InvokeInterface { .. } => opcodes::INVOKEINTERFACE,
            Insn::InvokeDynamic(_) => opcodes::INVOKEDYNAMIC,
            Insn::NewArray(_) => opcodes::NEWARRAY,
            Insn::MultiANewArray { .. } => opcodes::MULTIANEWARRAY,
            Insn::TableSwitch { .. } => opcodes::TABLESWITCH,
            Insn::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
        }
    }

    pub(crate) fn invoke_static(index: u16) -> Self {
        Insn::Indexed {
            opcode: opcodes::INVOKESTATIC,
            index,
        }
    }
}

/// Instruction together with its original offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) insn: Insn,
}

/// Decode raw method code into instructions.
pub(crate) fn decode(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let start = offset;
        let insn = decode_one(code, &mut offset)
            .with_context(|| format!("decode instruction at offset {}", start))?;
        instructions.push(Instruction {
            offset: start as u32,
            insn,
        });
    }
    Ok(instructions)
}

fn decode_one(code: &[u8], offset: &mut usize) -> Result<Insn> {
    let start = *offset;
    let opcode = read_u8(code, offset)?;
    let insn = match opcode {
        opcodes::BIPUSH => Insn::Bipush(read_u8(code, offset)? as i8),
        opcodes::SIPUSH => Insn::Sipush(read_u16(code, offset)? as i16),
        opcodes::LDC => Insn::Ldc(read_u8(code, offset)? as u16),
        opcodes::LDC_W => Insn::Ldc(read_u16(code, offset)?),
        opcodes::LDC2_W => Insn::Ldc2(read_u16(code, offset)?),
        opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE | opcodes::RET => {
            Insn::Local {
                opcode,
                index: read_u8(code, offset)? as u16,
            }
        }
        opcodes::IINC => Insn::Iinc {
            index: read_u8(code, offset)? as u16,
            delta: read_u8(code, offset)? as i8 as i16,
        },
        opcodes::WIDE => {
            let wide_opcode = read_u8(code, offset)?;
            let index = read_u16(code, offset)?;
            match wide_opcode {
                opcodes::IINC => Insn::Iinc {
                    index,
                    delta: read_u16(code, offset)? as i16,
                },
                opcodes::ILOAD..=opcodes::ALOAD
                | opcodes::ISTORE..=opcodes::ASTORE
                | opcodes::RET => Insn::Local {
                    opcode: wide_opcode,
                    index,
                },
                _ => anyhow::bail!("invalid wide opcode 0x{:02x}", wide_opcode),
            }
        }
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
            let branch = read_u16(code, offset)? as i16 as i64;
            Insn::Jump {
                opcode,
                target: branch_target(code, start, branch)?,
            }
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            let branch = read_u32(code, offset)? as i32 as i64;
            Insn::Jump {
                opcode: if opcode == opcodes::GOTO_W {
                    opcodes::GOTO
                } else {
                    opcodes::JSR
                },
                target: branch_target(code, start, branch)?,
            }
        }
        opcodes::TABLESWITCH => {
            *offset += padding(start);
            let default = branch_target(code, start, read_i32(code, offset)? as i64)?;
            let low = read_i32(code, offset)?;
            let high = read_i32(code, offset)?;
            let count = (high as i64) - (low as i64) + 1;
            if count < 0 {
                anyhow::bail!("invalid tableswitch range {}..{}", low, high);
            }
            let mut targets = Vec::with_capacity((count as usize).min(code.len() / 4));
            for _ in 0..count {
                targets.push(branch_target(code, start, read_i32(code, offset)? as i64)?);
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            }
        }
        opcodes::LOOKUPSWITCH => {
            *offset += padding(start);
            let default = branch_target(code, start, read_i32(code, offset)? as i64)?;
            let npairs = read_i32(code, offset)?;
            if npairs < 0 {
                anyhow::bail!("invalid lookupswitch pair count {}", npairs);
            }
            let mut pairs = Vec::with_capacity((npairs as usize).min(code.len() / 8));
            for _ in 0..npairs {
                let key = read_i32(code, offset)?;
                let target = branch_target(code, start, read_i32(code, offset)? as i64)?;
                pairs.push((key, target));
            }
            Insn::LookupSwitch { default, pairs }
        }
        opcodes::GETSTATIC..=opcodes::INVOKESTATIC
        | opcodes::NEW
        | opcodes::ANEWARRAY
        | opcodes::CHECKCAST
        | opcodes::INSTANCEOF => Insn::Indexed {
            opcode,
            index: read_u16(code, offset)?,
        },
        opcodes::INVOKEINTERFACE => {
            let index = read_u16(code, offset)?;
            let count = read_u8(code, offset)?;
            read_u8(code, offset)?;
            Insn::InvokeInterface { index, count }
        }
        opcodes::INVOKEDYNAMIC => {
            let index = read_u16(code, offset)?;
            read_u16(code, offset)?;
            Insn::InvokeDynamic(index)
        }
        opcodes::NEWARRAY => Insn::NewArray(read_u8(code, offset)?),
        opcodes::MULTIANEWARRAY => Insn::MultiANewArray {
            index: read_u16(code, offset)?,
            dimensions: read_u8(code, offset)?,
        },
        0x00..=0x0f
        | 0x1a..=0x35
        | 0x3b..=0x83
        | 0x85..=0x98
        | opcodes::IRETURN..=opcodes::RETURN
        | 0xbe
        | opcodes::ATHROW
        | opcodes::MONITORENTER
        | opcodes::MONITOREXIT
        | opcodes::BREAKPOINT
        | 0xfe
        | 0xff => Insn::Simple(opcode),
        _ => anyhow::bail!("unknown opcode 0x{:02x}", opcode),
    };
    Ok(insn)
}

fn branch_target(code: &[u8], start: usize, branch: i64) -> Result<u32> {
    let target = start as i64 + branch;
    if target < 0 || target >= code.len() as i64 {
        anyhow::bail!("branch target {} outside of method code", target);
    }
    Ok(target as u32)
}

fn read_i32(code: &[u8], offset: &mut usize) -> Result<i32> {
    Ok(read_u32(code, offset)? as i32)
}

/// Alignment bytes after a switch opcode at `offset`.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

/// Rewritten code for one original instruction.
///
/// `before` and `after` hold injected instructions; `body` replaces the
/// original instruction. A block that ends up empty is assembled as `nop`
/// so its label keeps a distinct position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Block {
    pub(crate) label: u32,
    pub(crate) before: Vec<Insn>,
    pub(crate) body: Vec<Insn>,
    pub(crate) after: Vec<Insn>,
}

impl Block {
    /// Block that reproduces the original instruction unchanged.
    pub(crate) fn original(instruction: &Instruction) -> Self {
        Self {
            label: instruction.offset,
            before: Vec::new(),
            body: vec![instruction.insn.clone()],
            after: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.before.is_empty() && self.body.is_empty() && self.after.is_empty()
    }
}

/// Result of laying out rewritten blocks.
#[derive(Clone, Debug)]
pub(crate) struct Assembled {
    pub(crate) code: Vec<u8>,
    /// Original offset to the new position of the start of its block.
    pub(crate) labels: HashMap<u32, u32>,
    /// Original offset to the new position of the instruction itself, after
    /// any injected prefix.
    pub(crate) anchors: HashMap<u32, u32>,
}

impl Assembled {
    pub(crate) fn label(&self, original: u32) -> Result<u32> {
        self.labels
            .get(&original)
            .copied()
            .with_context(|| format!("offset {} is not an instruction boundary", original))
    }

    pub(crate) fn anchor(&self, original: u32) -> Result<u32> {
        self.anchors
            .get(&original)
            .copied()
            .with_context(|| format!("offset {} is not an instruction boundary", original))
    }
}

/// Lay out blocks into method code. `original_length` becomes a label that
/// maps to the end of the new code, so exclusive range ends remap cleanly.
pub(crate) fn assemble(blocks: &[Block], original_length: u32) -> Result<Assembled> {
    let nop = [Insn::Simple(opcodes::NOP)];
    let mut flat: Vec<&Insn> = Vec::new();
    let mut starts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let start = flat.len();
        let anchor = start + block.before.len();
        if block.is_empty() {
            flat.extend(nop.iter());
        } else {
            flat.extend(block.before.iter());
            flat.extend(block.body.iter());
            flat.extend(block.after.iter());
        }
        starts.push((block.label, start, anchor));
    }

    let mut wide = vec![false; flat.len()];
    loop {
        let positions = layout(&flat, &wide)?;
        let (labels, anchors) = label_maps(&starts, &positions, original_length);
        let mut changed = false;
        for (index, insn) in flat.iter().enumerate() {
            if let Insn::Jump { opcode, target } = insn {
                let target_position = *labels
                    .get(target)
                    .with_context(|| format!("branch target {} is not an instruction", target))?;
                let delta = target_position as i64 - positions[index] as i64;
                if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                    if !matches!(*opcode, opcodes::GOTO | opcodes::JSR) {
                        anyhow::bail!(
                            "conditional branch at {} cannot reach offset {}",
                            positions[index],
                            target_position
                        );
                    }
                    if !wide[index] {
                        wide[index] = true;
                        changed = true;
                    }
                }
            }
        }
        if changed {
            continue;
        }

        let mut code = Vec::with_capacity(positions[flat.len()] as usize);
        for (index, insn) in flat.iter().enumerate() {
            encode(insn, positions[index], wide[index], &labels, &mut code)?;
        }
        if code.len() > u16::MAX as usize {
            anyhow::bail!("rewritten method code is {} bytes long", code.len());
        }
        return Ok(Assembled {
            code,
            labels,
            anchors,
        });
    }
}

fn layout(flat: &[&Insn], wide: &[bool]) -> Result<Vec<u32>> {
    let mut positions = Vec::with_capacity(flat.len() + 1);
    let mut position = 0u32;
    for (index, insn) in flat.iter().enumerate() {
        positions.push(position);
        position = position
            .checked_add(encoded_size(insn, position, wide[index]))
            .context("method code too large")?;
    }
    positions.push(position);
    Ok(positions)
}

fn label_maps(
    starts: &[(u32, usize, usize)],
    positions: &[u32],
    original_length: u32,
) -> (HashMap<u32, u32>, HashMap<u32, u32>) {
    let mut labels = HashMap::with_capacity(starts.len() + 1);
    let mut anchors = HashMap::with_capacity(starts.len());
    for (label, start, anchor) in starts {
        labels.insert(*label, positions[*start]);
        let anchor = (*anchor).min(positions.len() - 1);
        anchors.insert(*label, positions[anchor]);
    }
    if let Some(end) = positions.last() {
        labels.insert(original_length, *end);
    }
    (labels, anchors)
}

fn encoded_size(insn: &Insn, position: u32, wide: bool) -> u32 {
    match insn {
        Insn::Simple(_) => 1,
        Insn::Local { index, .. } => {
            if *index > u8::MAX as u16 {
                4
            } else {
                2
            }
        }
        Insn::Iinc { index, delta } => {
            if *index > u8::MAX as u16 || *delta < i8::MIN as i16 || *delta > i8::MAX as i16 {
                6
            } else {
                3
            }
        }
        Insn::Bipush(_) | Insn::NewArray(_) => 2,
        Insn::Sipush(_) | Insn::Ldc2(_) | Insn::Indexed { .. } => 3,
        Insn::Ldc(index) => {
            if *index > u8::MAX as u16 {
                3
            } else {
                2
            }
        }
        Insn::InvokeInterface { .. } | Insn::InvokeDynamic(_) => 5,
        Insn::MultiANewArray { .. } => 4,
        Insn::Jump { .. } => {
            if wide {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => {
            1 + padding(position as usize) as u32 + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            1 + padding(position as usize) as u32 + 8 + 8 * pairs.len() as u32
        }
    }
}

fn encode(
    insn: &Insn,
    position: u32,
    wide: bool,
    labels: &HashMap<u32, u32>,
    code: &mut Vec<u8>,
) -> Result<()> {
    let relative = |target: &u32| -> Result<i32> {
        let target_position = labels
            .get(target)
            .with_context(|| format!("branch target {} is not an instruction", target))?;
        Ok(*target_position as i32 - position as i32)
    };
    match insn {
        Insn::Simple(opcode) => code.push(*opcode),
        Insn::Local { opcode, index } => {
            if *index > u8::MAX as u16 {
                code.push(opcodes::WIDE);
                code.push(*opcode);
                push_u16(code, *index);
            } else {
                code.push(*opcode);
                code.push(*index as u8);
            }
        }
        Insn::Iinc { index, delta } => {
            if *index > u8::MAX as u16 || *delta < i8::MIN as i16 || *delta > i8::MAX as i16 {
                code.push(opcodes::WIDE);
                code.push(opcodes::IINC);
                push_u16(code, *index);
                push_u16(code, *delta as u16);
            } else {
                code.push(opcodes::IINC);
                code.push(*index as u8);
                code.push(*delta as i8 as u8);
            }
        }
        Insn::Bipush(value) => {
            code.push(opcodes::BIPUSH);
            code.push(*value as u8);
        }
        Insn::Sipush(value) => {
            code.push(opcodes::SIPUSH);
            push_u16(code, *value as u16);
        }
        Insn::Ldc(index) => {
            if *index > u8::MAX as u16 {
                code.push(opcodes::LDC_W);
                push_u16(code, *index);
            } else {
                code.push(opcodes::LDC);
                code.push(*index as u8);
            }
        }
        Insn::Ldc2(index) => {
            code.push(opcodes::LDC2_W);
            push_u16(code, *index);
        }
        Insn::Indexed { opcode, index } => {
            code.push(*opcode);
            push_u16(code, *index);
        }
        Insn::InvokeInterface { index, count } => {
            code.push(opcodes::INVOKEINTERFACE);
            push_u16(code, *index);
            code.push(*count);
            code.push(0);
        }
        Insn::InvokeDynamic(index) => {
            code.push(opcodes::INVOKEDYNAMIC);
            push_u16(code, *index);
            push_u16(code, 0);
        }
        Insn::NewArray(atype) => {
            code.push(opcodes::NEWARRAY);
            code.push(*atype);
        }
        Insn::MultiANewArray { index, dimensions } => {
            code.push(opcodes::MULTIANEWARRAY);
            push_u16(code, *index);
            code.push(*dimensions);
        }
        Insn::Jump { opcode, target } => {
            let offset = relative(target)?;
            if wide {
                code.push(if *opcode == opcodes::JSR {
                    opcodes::JSR_W
                } else {
                    opcodes::GOTO_W
                });
                push_u32(code, offset as u32);
            } else {
                code.push(*opcode);
                push_u16(code, offset as i16 as u16);
            }
        }
        Insn::TableSwitch {
            default,
            low,
            targets,
        } => {
            code.push(opcodes::TABLESWITCH);
            code.extend(std::iter::repeat_n(0u8, padding(position as usize)));
            push_u32(code, relative(default)? as u32);
            push_u32(code, *low as u32);
            let high = *low as i64 + targets.len() as i64 - 1;
            push_u32(code, high as i32 as u32);
            for target in targets {
                push_u32(code, relative(target)? as u32);
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            code.push(opcodes::LOOKUPSWITCH);
            code.extend(std::iter::repeat_n(0u8, padding(position as usize)));
            push_u32(code, relative(default)? as u32);
            push_u32(code, pairs.len() as u32);
            for (key, target) in pairs {
                push_u32(code, *key as u32);
                push_u32(code, relative(target)? as u32);
            }
        }
    }
    Ok(())
}

/// Load opcode for a field descriptor's leading character.
pub(crate) fn load_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'J') => opcodes::LLOAD,
        Some(b'F') => opcodes::FLOAD,
        Some(b'D') => opcodes::DLOAD,
        Some(b'L') | Some(b'[') => opcodes::ALOAD,
        _ => opcodes::ILOAD,
    }
}

/// Return opcode for a method's return descriptor.
pub(crate) fn return_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'V') => opcodes::RETURN,
        Some(b'J') => opcodes::LRETURN,
        Some(b'F') => opcodes::FRETURN,
        Some(b'D') => opcodes::DRETURN,
        Some(b'L') | Some(b'[') => opcodes::ARETURN,
        _ => opcodes::IRETURN,
    }
}

/// Instruction pushing the zero value of a field descriptor.
pub(crate) fn default_value(descriptor: &str) -> Insn {
    match descriptor.as_bytes().first() {
        Some(b'J') => Insn::Simple(opcodes::LCONST_0),
        Some(b'F') => Insn::Simple(opcodes::FCONST_0),
        Some(b'D') => Insn::Simple(opcodes::DCONST_0),
        Some(b'L') | Some(b'[') => Insn::Simple(opcodes::ACONST_NULL),
        _ => Insn::Simple(opcodes::ICONST_0),
    }
}
