use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::classfile::code::Assembled;
use crate::classfile::reader::{read_u16, read_u8};
use crate::classfile::writer::push_u16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Same,
    SameLocals1Stack(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

/// Stack map frame at an absolute code offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) offset: u32,
    pub(crate) kind: FrameKind,
}

pub(crate) fn parse_stack_map(info: &[u8]) -> Result<Vec<Frame>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)? as usize;
    let mut frames = Vec::with_capacity(count);
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let frame_type = read_u8(info, &mut offset)?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u32,
                FrameKind::SameLocals1Stack(read_verification_type(info, &mut offset)?),
            ),
            247 => {
                let delta = read_u16(info, &mut offset)? as u32;
                (
                    delta,
                    FrameKind::SameLocals1Stack(read_verification_type(info, &mut offset)?),
                )
            }
            248..=250 => (
                read_u16(info, &mut offset)? as u32,
                FrameKind::Chop(251 - frame_type),
            ),
            251 => (read_u16(info, &mut offset)? as u32, FrameKind::Same),
            252..=254 => {
                let delta = read_u16(info, &mut offset)? as u32;
                let mut locals = Vec::new();
                for _ in 0..(frame_type - 251) {
                    locals.push(read_verification_type(info, &mut offset)?);
                }
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = read_u16(info, &mut offset)? as u32;
                let locals = read_verification_types(info, &mut offset)?;
                let stack = read_verification_types(info, &mut offset)?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => anyhow::bail!("reserved stack map frame type {}", frame_type),
        };
        let frame_offset = match previous {
            None => delta,
            Some(previous) => previous + delta + 1,
        };
        previous = Some(frame_offset);
        frames.push(Frame {
            offset: frame_offset,
            kind,
        });
    }
    Ok(frames)
}

fn read_verification_types(info: &[u8], offset: &mut usize) -> Result<Vec<VerificationType>> {
    let count = read_u16(info, offset)? as usize;
    let mut types = Vec::with_capacity(count.min(info.len()));
    for _ in 0..count {
        types.push(read_verification_type(info, offset)?);
    }
    Ok(types)
}

fn read_verification_type(info: &[u8], offset: &mut usize) -> Result<VerificationType> {
    let tag = read_u8(info, offset)?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(read_u16(info, offset)?),
        8 => VerificationType::Uninitialized(read_u16(info, offset)? as u32),
        _ => anyhow::bail!("invalid verification type tag {}", tag),
    })
}

/// Move frames to the new layout. Frames follow block labels; uninitialized
/// types follow the `new` instruction itself.
pub(crate) fn remap_frames(frames: &[Frame], assembled: &Assembled) -> Result<Vec<Frame>> {
    let remap_type = |value: &VerificationType| -> Result<VerificationType> {
        Ok(match value {
            VerificationType::Uninitialized(offset) => {
                VerificationType::Uninitialized(assembled.anchor(*offset).with_context(|| {
                    format!("uninitialized value created at {}", offset)
                })?)
            }
            other => other.clone(),
        })
    };
    let remap_types = |values: &[VerificationType]| -> Result<Vec<VerificationType>> {
        values.iter().map(remap_type).collect()
    };

    frames
        .iter()
        .map(|frame| {
            let kind = match &frame.kind {
                FrameKind::Same => FrameKind::Same,
                FrameKind::SameLocals1Stack(value) => FrameKind::SameLocals1Stack(remap_type(value)?),
                FrameKind::Chop(count) => FrameKind::Chop(*count),
                FrameKind::Append(locals) => FrameKind::Append(remap_types(locals)?),
                FrameKind::Full { locals, stack } => FrameKind::Full {
                    locals: remap_types(locals)?,
                    stack: remap_types(stack)?,
                },
            };
            Ok(Frame {
                offset: assembled.label(frame.offset)?,
                kind,
            })
        })
        .collect()
}

/// Give the frames at `handlers` (original offsets) a single stack item of
/// class `class_index`. The verifier types the value a catch-any handler
/// receives as the host `java/lang/Throwable`, whatever the pool says.
pub(crate) fn retype_handler_stack(frames: &mut [Frame], handlers: &HashSet<u32>, class_index: u16) {
    for frame in frames.iter_mut().filter(|frame| handlers.contains(&frame.offset)) {
        match &mut frame.kind {
            FrameKind::SameLocals1Stack(value @ VerificationType::Object(_)) => {
                *value = VerificationType::Object(class_index);
            }
            FrameKind::Full { stack, .. } if stack.len() == 1 => {
                if let VerificationType::Object(_) = stack[0] {
                    stack[0] = VerificationType::Object(class_index);
                }
            }
            _ => {}
        }
    }
}

/// Encode frames, picking the extended form whenever a delta outgrows the
/// compact one.
pub(crate) fn encode_stack_map(frames: &[Frame]) -> Result<Vec<u8>> {
    let mut info = Vec::new();
    push_u16(
        &mut info,
        u16::try_from(frames.len()).context("too many stack map frames")?,
    );
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(previous) => frame
                .offset
                .checked_sub(previous + 1)
                .context("stack map frames out of order")?,
        };
        previous = Some(frame.offset);
        let delta = u16::try_from(delta).context("stack map offset delta too large")?;
        match &frame.kind {
            FrameKind::Same => {
                if delta <= 63 {
                    info.push(delta as u8);
                } else {
                    info.push(251);
                    push_u16(&mut info, delta);
                }
            }
            FrameKind::SameLocals1Stack(value) => {
                if delta <= 63 {
                    info.push(64 + delta as u8);
                } else {
                    info.push(247);
                    push_u16(&mut info, delta);
                }
                push_verification_type(&mut info, value)?;
            }
            FrameKind::Chop(count) => {
                info.push(251 - count);
                push_u16(&mut info, delta);
            }
            FrameKind::Append(locals) => {
                info.push(251 + locals.len() as u8);
                push_u16(&mut info, delta);
                for value in locals {
                    push_verification_type(&mut info, value)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                info.push(255);
                push_u16(&mut info, delta);
                push_u16(&mut info, locals.len() as u16);
                for value in locals {
                    push_verification_type(&mut info, value)?;
                }
                push_u16(&mut info, stack.len() as u16);
                for value in stack {
                    push_verification_type(&mut info, value)?;
                }
            }
        }
    }
    Ok(info)
}

fn push_verification_type(info: &mut Vec<u8>, value: &VerificationType) -> Result<()> {
    match value {
        VerificationType::Top => info.push(0),
        VerificationType::Integer => info.push(1),
        VerificationType::Float => info.push(2),
        VerificationType::Double => info.push(3),
        VerificationType::Long => info.push(4),
        VerificationType::Null => info.push(5),
        VerificationType::UninitializedThis => info.push(6),
        VerificationType::Object(index) => {
            info.push(7);
            push_u16(info, *index);
        }
        VerificationType::Uninitialized(offset) => {
            info.push(8);
            push_u16(
                info,
                u16::try_from(*offset).context("uninitialized offset too large")?,
            );
        }
    }
    Ok(())
}
