use core::fmt;

macro_rules! operand_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                Self::ALL.get(byte as usize).copied().ok_or(byte)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.mnemonic())
            }
        }
    };
}

operand_enum! {
    /// Stack type of an arithmetic, compare or branch operand.
    ///
    /// Native-sized integers use [`NumTy::I8`]; the interpreter only targets
    /// 64-bit hosts.
    pub enum NumTy {
        I4 => "i4",
        I8 => "i8",
        R4 => "r4",
        R8 => "r8",
    }
}

operand_enum! {
    /// Memory type for loads and stores between cells and storage.
    pub enum MemTy {
        I1 => "i1",
        U1 => "u1",
        I2 => "i2",
        U2 => "u2",
        I4 => "i4",
        U4 => "u4",
        I8 => "i8",
        R4 => "r4",
        R8 => "r8",
        I => "i",
        Ref => "ref",
    }
}

operand_enum! {
    /// Conversion target type.
    pub enum ConvTy {
        I1 => "i1",
        U1 => "u1",
        I2 => "i2",
        U2 => "u2",
        I4 => "i4",
        U4 => "u4",
        I8 => "i8",
        U8 => "u8",
        R4 => "r4",
        R8 => "r8",
        RUn => "r.un",
        I => "i",
        U => "u",
    }
}

operand_enum! {
    /// Comparison condition shared by `Compare` and `BrCmp`.
    ///
    /// The `Un` forms compare integers as unsigned and are true for
    /// unordered floating-point operands; the others are false when either
    /// operand is NaN.
    pub enum Cond {
        Eq => "eq",
        NeUn => "ne.un",
        Gt => "gt",
        GtUn => "gt.un",
        Ge => "ge",
        GeUn => "ge.un",
        Lt => "lt",
        LtUn => "lt.un",
        Le => "le",
        LeUn => "le.un",
    }
}

impl NumTy {
    pub const fn is_float(self) -> bool {
        matches!(self, NumTy::R4 | NumTy::R8)
    }
}

impl MemTy {
    /// Size of the stored value in bytes.
    pub const fn size(self) -> usize {
        match self {
            MemTy::I1 | MemTy::U1 => 1,
            MemTy::I2 | MemTy::U2 => 2,
            MemTy::I4 | MemTy::U4 | MemTy::R4 => 4,
            MemTy::I8 | MemTy::R8 | MemTy::I | MemTy::Ref => 8,
        }
    }
}

impl Cond {
    /// Whether the condition holds for an unordered (NaN) comparison.
    pub const fn unordered_result(self) -> bool {
        matches!(
            self,
            Cond::NeUn | Cond::GtUn | Cond::GeUn | Cond::LtUn | Cond::LeUn
        )
    }

    /// Whether integer operands are compared as unsigned.
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Cond::GtUn | Cond::GeUn | Cond::LtUn | Cond::LeUn)
    }
}
