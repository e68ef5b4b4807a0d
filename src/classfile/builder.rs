//! Test support: assemble small class files with the crate's own writer.

use std::collections::HashMap;

use crate::classfile::attributes::{
    self, encode_line_numbers, CodeAttribute, ExceptionEntry, LineNumber,
};
use crate::classfile::code::{assemble, Block, Insn};
use crate::classfile::stack_map::{encode_stack_map, Frame, FrameKind, VerificationType};
use crate::classfile::writer::push_u16;
use crate::classfile::{
    class_file_to_bytes, Attribute, ClassFile, Constant, ConstantPool, MemberInfo, ACC_PUBLIC,
};
use crate::opcodes;

const ACC_SUPER: u16 = 0x0020;

/// Static argument of a bootstrap method.
#[derive(Clone, Debug)]
pub(crate) enum BootstrapArg {
    MethodType(String),
    Handle {
        kind: u8,
        owner: String,
        name: String,
        descriptor: String,
        is_interface: bool,
    },
}

#[derive(Clone, Debug)]
enum FieldValue {
    Constant(Constant),
    String(String),
}

struct FieldSpec {
    access: u16,
    name: String,
    descriptor: String,
    value: Option<FieldValue>,
}

struct MethodSpec {
    access: u16,
    name: String,
    descriptor: String,
    code: Option<CodeBuilder>,
    exceptions: Vec<String>,
}

pub(crate) struct ClassBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: u16,
    major_version: u16,
    source_file: Option<String>,
    signature: Option<String>,
    annotations: Vec<String>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: ACC_PUBLIC | ACC_SUPER,
            major_version: 52,
            source_file: None,
            signature: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn version(mut self, major_version: u16) -> Self {
        self.major_version = major_version;
        self
    }

    pub(crate) fn access(mut self, access: u16) -> Self {
        self.access = access;
        self
    }

    pub(crate) fn super_class(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_string());
        self
    }

    pub(crate) fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub(crate) fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(name.to_string());
        self
    }

    pub(crate) fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub(crate) fn annotation(mut self, descriptor: &str) -> Self {
        self.annotations.push(descriptor.to_string());
        self
    }

    pub(crate) fn field(mut self, access: u16, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            value: None,
        });
        self
    }

    pub(crate) fn field_with_constant(
        mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        value: Constant,
    ) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            value: Some(FieldValue::Constant(value)),
        });
        self
    }

    pub(crate) fn string_field(mut self, access: u16, name: &str, value: &str) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
            value: Some(FieldValue::String(value.to_string())),
        });
        self
    }

    pub(crate) fn method(
        mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        body: impl FnOnce(CodeBuilder) -> CodeBuilder,
    ) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Some(body(CodeBuilder::default())),
            exceptions: Vec::new(),
        });
        self
    }

    pub(crate) fn method_throws(
        mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        exceptions: &[&str],
        body: impl FnOnce(CodeBuilder) -> CodeBuilder,
    ) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Some(body(CodeBuilder::default())),
            exceptions: exceptions.iter().map(|name| name.to_string()).collect(),
        });
        self
    }

    /// Method without a `Code` attribute (abstract or native).
    pub(crate) fn bodiless_method(mut self, access: u16, name: &str, descriptor: &str) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
            exceptions: Vec::new(),
        });
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        class_file_to_bytes(&self.build_class_file()).expect("write class file")
    }

    pub(crate) fn build_class_file(self) -> ClassFile {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(&self.name).expect("this class");
        let super_class = match &self.super_name {
            Some(name) => pool.add_class(name).expect("super class"),
            None => 0,
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|name| pool.add_class(name).expect("interface"))
            .collect();

        let mut fields = Vec::new();
        for field in &self.fields {
            let mut field_attributes = Vec::new();
            if let Some(value) = &field.value {
                let index = match value {
                    FieldValue::Constant(constant) => pool.add(constant.clone()),
                    FieldValue::String(value) => pool.add_string(value),
                }
                .expect("constant value");
                field_attributes.push(Attribute {
                    name_index: pool.add_utf8(attributes::CONSTANT_VALUE).expect("utf8"),
                    info: index.to_be_bytes().to_vec(),
                });
            }
            fields.push(MemberInfo {
                access_flags: field.access,
                name_index: pool.add_utf8(&field.name).expect("utf8"),
                descriptor_index: pool.add_utf8(&field.descriptor).expect("utf8"),
                attributes: field_attributes,
            });
        }

        let mut bootstrap_methods = Vec::new();
        let mut methods = Vec::new();
        for method in self.methods {
            let mut method_attributes = Vec::new();
            if let Some(code) = method.code {
                let info = code.assemble(&mut pool, &mut bootstrap_methods);
                method_attributes.push(Attribute {
                    name_index: pool.add_utf8(attributes::CODE).expect("utf8"),
                    info,
                });
            }
            if !method.exceptions.is_empty() {
                let mut info = Vec::new();
                push_u16(&mut info, method.exceptions.len() as u16);
                for exception in &method.exceptions {
                    push_u16(&mut info, pool.add_class(exception).expect("exception"));
                }
                method_attributes.push(Attribute {
                    name_index: pool.add_utf8(attributes::EXCEPTIONS).expect("utf8"),
                    info,
                });
            }
            methods.push(MemberInfo {
                access_flags: method.access,
                name_index: pool.add_utf8(&method.name).expect("utf8"),
                descriptor_index: pool.add_utf8(&method.descriptor).expect("utf8"),
                attributes: method_attributes,
            });
        }

        let mut class_attributes = Vec::new();
        if let Some(source_file) = &self.source_file {
            let index = pool.add_utf8(source_file).expect("utf8");
            class_attributes.push(Attribute {
                name_index: pool.add_utf8(attributes::SOURCE_FILE).expect("utf8"),
                info: index.to_be_bytes().to_vec(),
            });
        }
        if let Some(signature) = &self.signature {
            let index = pool.add_utf8(signature).expect("utf8");
            class_attributes.push(Attribute {
                name_index: pool.add_utf8(attributes::SIGNATURE).expect("utf8"),
                info: index.to_be_bytes().to_vec(),
            });
        }
        if !self.annotations.is_empty() {
            let mut info = Vec::new();
            push_u16(&mut info, self.annotations.len() as u16);
            for annotation in &self.annotations {
                push_u16(&mut info, pool.add_utf8(annotation).expect("utf8"));
                push_u16(&mut info, 0);
            }
            class_attributes.push(Attribute {
                name_index: pool
                    .add_utf8(attributes::RUNTIME_VISIBLE_ANNOTATIONS)
                    .expect("utf8"),
                info,
            });
        }
        if !bootstrap_methods.is_empty() {
            let mut info = Vec::new();
            push_u16(&mut info, bootstrap_methods.len() as u16);
            for (method_ref, arguments) in &bootstrap_methods {
                push_u16(&mut info, *method_ref);
                push_u16(&mut info, arguments.len() as u16);
                for argument in arguments {
                    push_u16(&mut info, *argument);
                }
            }
            class_attributes.push(Attribute {
                name_index: pool.add_utf8(attributes::BOOTSTRAP_METHODS).expect("utf8"),
                info,
            });
        }

        ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: pool,
            access_flags: self.access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes: class_attributes,
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insn(Insn),
    Ldc(String),
    LdcInt(i32),
    Member {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
        is_interface: bool,
    },
    Type {
        opcode: u8,
        class: String,
    },
    Jump {
        opcode: u8,
        label: u32,
    },
    InvokeDynamic {
        bootstrap: (String, String, String),
        name: String,
        descriptor: String,
        arguments: Vec<BootstrapArg>,
    },
    Label(u32),
}

#[derive(Default)]
pub(crate) struct CodeBuilder {
    ops: Vec<Op>,
    handlers: Vec<(u32, u32, u32, Option<String>)>,
    lines: Vec<(u32, u16)>,
    frames: Vec<(u32, FrameKind)>,
    /// Frames with one object of the named class on the stack.
    object_frames: Vec<(u32, String)>,
    max_stack: Option<u16>,
    max_locals: Option<u16>,
}

impl CodeBuilder {
    pub(crate) fn op(mut self, opcode: u8) -> Self {
        self.ops.push(Op::Insn(Insn::Simple(opcode)));
        self
    }

    pub(crate) fn insn(mut self, insn: Insn) -> Self {
        self.ops.push(Op::Insn(insn));
        self
    }

    pub(crate) fn bipush(self, value: i8) -> Self {
        self.insn(Insn::Bipush(value))
    }

    pub(crate) fn load(self, opcode: u8, index: u16) -> Self {
        self.insn(Insn::Local { opcode, index })
    }

    pub(crate) fn ldc_string(mut self, value: &str) -> Self {
        self.ops.push(Op::Ldc(value.to_string()));
        self
    }

    pub(crate) fn ldc_int(mut self, value: i32) -> Self {
        self.ops.push(Op::LdcInt(value));
        self
    }

    fn member(mut self, opcode: u8, owner: &str, name: &str, descriptor: &str, is_interface: bool) -> Self {
        self.ops.push(Op::Member {
            opcode,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_interface,
        });
        self
    }

    pub(crate) fn invoke_static(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::INVOKESTATIC, owner, name, descriptor, false)
    }

    pub(crate) fn invoke_virtual(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::INVOKEVIRTUAL, owner, name, descriptor, false)
    }

    pub(crate) fn invoke_special(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::INVOKESPECIAL, owner, name, descriptor, false)
    }

    pub(crate) fn invoke_interface(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::INVOKEINTERFACE, owner, name, descriptor, true)
    }

    pub(crate) fn get_static(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::GETSTATIC, owner, name, descriptor, false)
    }

    pub(crate) fn put_static(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(opcodes::PUTSTATIC, owner, name, descriptor, false)
    }

    pub(crate) fn new_object(mut self, class: &str) -> Self {
        self.ops.push(Op::Type {
            opcode: opcodes::NEW,
            class: class.to_string(),
        });
        self
    }

    pub(crate) fn anew_array(mut self, class: &str) -> Self {
        self.ops.push(Op::Type {
            opcode: opcodes::ANEWARRAY,
            class: class.to_string(),
        });
        self
    }

    pub(crate) fn new_array(self, atype: u8) -> Self {
        self.insn(Insn::NewArray(atype))
    }

    pub(crate) fn invoke_dynamic(
        mut self,
        bootstrap: (&str, &str, &str),
        name: &str,
        descriptor: &str,
        arguments: Vec<BootstrapArg>,
    ) -> Self {
        self.ops.push(Op::InvokeDynamic {
            bootstrap: (
                bootstrap.0.to_string(),
                bootstrap.1.to_string(),
                bootstrap.2.to_string(),
            ),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            arguments,
        });
        self
    }

    pub(crate) fn label(mut self, label: u32) -> Self {
        self.ops.push(Op::Label(label));
        self
    }

    pub(crate) fn jump(mut self, opcode: u8, label: u32) -> Self {
        self.ops.push(Op::Jump { opcode, label });
        self
    }

    pub(crate) fn try_catch(mut self, start: u32, end: u32, handler: u32, catch_type: Option<&str>) -> Self {
        self.handlers
            .push((start, end, handler, catch_type.map(|name| name.to_string())));
        self
    }

    pub(crate) fn line(mut self, label: u32, line: u16) -> Self {
        self.lines.push((label, line));
        self
    }

    pub(crate) fn frame(mut self, label: u32, kind: FrameKind) -> Self {
        self.frames.push((label, kind));
        self
    }

    pub(crate) fn object_frame(mut self, label: u32, class: &str) -> Self {
        self.object_frames.push((label, class.to_string()));
        self
    }

    pub(crate) fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    pub(crate) fn max_locals(mut self, max_locals: u16) -> Self {
        self.max_locals = Some(max_locals);
        self
    }

    pub(crate) fn call_object_init(self) -> Self {
        self.load(opcodes::ALOAD, 0)
            .invoke_special("java/lang/Object", "<init>", "()V")
    }

    pub(crate) fn op_return(self) -> Self {
        self.op(opcodes::RETURN)
    }

    fn assemble(self, pool: &mut ConstantPool, bootstrap_methods: &mut Vec<(u16, Vec<u16>)>) -> Vec<u8> {
        // Block labels are instruction ordinals; user labels resolve to the
        // ordinal of the next instruction.
        let mut label_ordinals = HashMap::new();
        let mut ordinal = 0u32;
        for op in &self.ops {
            match op {
                Op::Label(label) => {
                    label_ordinals.insert(*label, ordinal);
                }
                _ => ordinal += 1,
            }
        }
        let resolve = |label: &u32| *label_ordinals.get(label).expect("label defined");

        let mut blocks = Vec::new();
        for op in self.ops {
            let insn = match op {
                Op::Label(_) => continue,
                Op::Insn(insn) => insn,
                Op::Ldc(value) => Insn::Ldc(pool.add_string(&value).expect("string")),
                Op::LdcInt(value) => Insn::Ldc(pool.add_integer(value).expect("integer")),
                Op::Member {
                    opcode,
                    owner,
                    name,
                    descriptor,
                    is_interface,
                } => {
                    let index = if matches!(opcode, opcodes::GETSTATIC..=opcodes::PUTFIELD) {
                        pool.add_field_ref(&owner, &name, &descriptor)
                    } else {
                        pool.add_method_ref(&owner, &name, &descriptor, is_interface)
                    }
                    .expect("member ref");
                    if opcode == opcodes::INVOKEINTERFACE {
                        Insn::InvokeInterface { index, count: 1 }
                    } else {
                        Insn::Indexed { opcode, index }
                    }
                }
                Op::Type { opcode, class } => Insn::Indexed {
                    opcode,
                    index: pool.add_class(&class).expect("class"),
                },
                Op::Jump { opcode, label } => Insn::Jump {
                    opcode,
                    target: resolve(&label),
                },
                Op::InvokeDynamic {
                    bootstrap,
                    name,
                    descriptor,
                    arguments,
                } => {
                    let method_ref = pool
                        .add_method_ref(&bootstrap.0, &bootstrap.1, &bootstrap.2, false)
                        .expect("bootstrap ref");
                    let handle = pool
                        .add(Constant::MethodHandle {
                            reference_kind: opcodes::REF_INVOKE_STATIC,
                            reference_index: method_ref,
                        })
                        .expect("bootstrap handle");
                    let argument_indices = arguments
                        .iter()
                        .map(|argument| match argument {
                            BootstrapArg::MethodType(descriptor) => {
                                let descriptor_index = pool.add_utf8(descriptor).expect("utf8");
                                pool.add(Constant::MethodType { descriptor_index })
                            }
                            BootstrapArg::Handle {
                                kind,
                                owner,
                                name,
                                descriptor,
                                is_interface,
                            } => {
                                let reference_index = pool
                                    .add_method_ref(owner, name, descriptor, *is_interface)
                                    .expect("handle target");
                                pool.add(Constant::MethodHandle {
                                    reference_kind: *kind,
                                    reference_index,
                                })
                            }
                        }
                        .expect("bootstrap argument"))
                        .collect();
                    bootstrap_methods.push((handle, argument_indices));
                    let name_and_type_index =
                        pool.add_name_and_type(&name, &descriptor).expect("nat");
                    let index = pool
                        .add(Constant::InvokeDynamic {
                            bootstrap_method_attr_index: (bootstrap_methods.len() - 1) as u16,
                            name_and_type_index,
                        })
                        .expect("invokedynamic");
                    Insn::InvokeDynamic(index)
                }
            };
            let label = blocks.len() as u32;
            blocks.push(Block {
                label,
                before: Vec::new(),
                body: vec![insn],
                after: Vec::new(),
            });
        }

        let assembled = assemble(&blocks, blocks.len() as u32).expect("assemble test code");
        let position = |label: &u32| assembled.label(resolve(label)).expect("label position") as u16;

        let exception_table = self
            .handlers
            .iter()
            .map(|(start, end, handler, catch_type)| ExceptionEntry {
                start_pc: position(start),
                end_pc: position(end),
                handler_pc: position(handler),
                catch_type: catch_type
                    .as_ref()
                    .map(|name| pool.add_class(name).expect("catch type"))
                    .unwrap_or(0),
            })
            .collect();

        let mut code_attributes = Vec::new();
        if !self.lines.is_empty() {
            let lines: Vec<LineNumber> = self
                .lines
                .iter()
                .map(|(label, line)| LineNumber {
                    start_pc: position(label),
                    line: *line,
                })
                .collect();
            code_attributes.push(Attribute {
                name_index: pool.add_utf8(attributes::LINE_NUMBER_TABLE).expect("utf8"),
                info: encode_line_numbers(&lines),
            });
        }
        if !self.frames.is_empty() || !self.object_frames.is_empty() {
            let mut frames: Vec<Frame> = self
                .frames
                .iter()
                .map(|(label, kind)| Frame {
                    offset: position(label) as u32,
                    kind: kind.clone(),
                })
                .collect();
            for (label, class) in &self.object_frames {
                frames.push(Frame {
                    offset: position(label) as u32,
                    kind: FrameKind::SameLocals1Stack(VerificationType::Object(
                        pool.add_class(class).expect("frame class"),
                    )),
                });
            }
            frames.sort_by_key(|frame| frame.offset);
            code_attributes.push(Attribute {
                name_index: pool.add_utf8(attributes::STACK_MAP_TABLE).expect("utf8"),
                info: encode_stack_map(&frames).expect("stack map"),
            });
        }

        CodeAttribute {
            max_stack: self.max_stack.unwrap_or(8),
            max_locals: self.max_locals.unwrap_or(8),
            code: assembled.code,
            exception_table,
            attributes: code_attributes,
        }
        .encode()
        .expect("encode code")
    }
}
