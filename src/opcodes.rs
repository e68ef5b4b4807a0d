//! JVM opcode constants used by the decoder, the rules and the emitters.

pub(crate) const NOP: u8 = 0x00;
pub(crate) const ACONST_NULL: u8 = 0x01;
pub(crate) const ICONST_0: u8 = 0x03;
pub(crate) const LCONST_0: u8 = 0x09;
pub(crate) const FCONST_0: u8 = 0x0b;
pub(crate) const DCONST_0: u8 = 0x0e;
pub(crate) const BIPUSH: u8 = 0x10;
pub(crate) const SIPUSH: u8 = 0x11;
pub(crate) const LDC: u8 = 0x12;
pub(crate) const LDC_W: u8 = 0x13;
pub(crate) const LDC2_W: u8 = 0x14;
pub(crate) const ILOAD: u8 = 0x15;
pub(crate) const LLOAD: u8 = 0x16;
pub(crate) const FLOAD: u8 = 0x17;
pub(crate) const DLOAD: u8 = 0x18;
pub(crate) const ALOAD: u8 = 0x19;
pub(crate) const ISTORE: u8 = 0x36;
pub(crate) const ASTORE: u8 = 0x3a;
pub(crate) const POP: u8 = 0x57;
pub(crate) const POP2: u8 = 0x58;
pub(crate) const DUP: u8 = 0x59;
pub(crate) const IINC: u8 = 0x84;
pub(crate) const IFEQ: u8 = 0x99;
pub(crate) const GOTO: u8 = 0xa7;
pub(crate) const JSR: u8 = 0xa8;
pub(crate) const RET: u8 = 0xa9;
pub(crate) const TABLESWITCH: u8 = 0xaa;
pub(crate) const LOOKUPSWITCH: u8 = 0xab;
pub(crate) const IRETURN: u8 = 0xac;
pub(crate) const LRETURN: u8 = 0xad;
pub(crate) const FRETURN: u8 = 0xae;
pub(crate) const DRETURN: u8 = 0xaf;
pub(crate) const ARETURN: u8 = 0xb0;
pub(crate) const RETURN: u8 = 0xb1;
pub(crate) const GETSTATIC: u8 = 0xb2;
pub(crate) const PUTSTATIC: u8 = 0xb3;
pub(crate) const GETFIELD: u8 = 0xb4;
pub(crate) const PUTFIELD: u8 = 0xb5;
pub(crate) const INVOKEVIRTUAL: u8 = 0xb6;
pub(crate) const INVOKESPECIAL: u8 = 0xb7;
pub(crate) const INVOKESTATIC: u8 = 0xb8;
pub(crate) const INVOKEINTERFACE: u8 = 0xb9;
pub(crate) const INVOKEDYNAMIC: u8 = 0xba;
pub(crate) const NEW: u8 = 0xbb;
pub(crate) const NEWARRAY: u8 = 0xbc;
pub(crate) const ANEWARRAY: u8 = 0xbd;
pub(crate) const ATHROW: u8 = 0xbf;
pub(crate) const CHECKCAST: u8 = 0xc0;
pub(crate) const INSTANCEOF: u8 = 0xc1;
pub(crate) const MONITORENTER: u8 = 0xc2;
pub(crate) const MONITOREXIT: u8 = 0xc3;
pub(crate) const WIDE: u8 = 0xc4;
pub(crate) const MULTIANEWARRAY: u8 = 0xc5;
pub(crate) const IFNULL: u8 = 0xc6;
pub(crate) const IFNONNULL: u8 = 0xc7;
pub(crate) const GOTO_W: u8 = 0xc8;
pub(crate) const JSR_W: u8 = 0xc9;
pub(crate) const BREAKPOINT: u8 = 0xca;

/// `newarray` element type codes.
pub(crate) const T_BOOLEAN: u8 = 4;
pub(crate) const T_CHAR: u8 = 5;
pub(crate) const T_FLOAT: u8 = 6;
pub(crate) const T_DOUBLE: u8 = 7;
pub(crate) const T_BYTE: u8 = 8;
pub(crate) const T_SHORT: u8 = 9;
pub(crate) const T_INT: u8 = 10;
pub(crate) const T_LONG: u8 = 11;

/// Method handle reference kinds.
pub(crate) const REF_INVOKE_VIRTUAL: u8 = 5;
pub(crate) const REF_INVOKE_STATIC: u8 = 6;
pub(crate) const REF_INVOKE_INTERFACE: u8 = 9;

pub(crate) fn is_return(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN)
}

pub(crate) fn is_invoke(opcode: u8) -> bool {
    matches!(
        opcode,
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE | INVOKEDYNAMIC
    )
}
