use std::fmt;

macro_rules! opcodes {
    ($($variant:ident = $value:expr => $name:expr),* $(,)?) => {
        /// Request opcodes understood by the channel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }

        impl TryFrom<u32> for Opcode {
            type Error = u32;

            fn try_from(value: u32) -> Result<Self, u32> {
                match value {
                    $($value => Ok(Opcode::$variant),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    Lookup = 1 => "LOOKUP",
    Forget = 2 => "FORGET",
    Getattr = 3 => "GETATTR",
    Setattr = 4 => "SETATTR",
    Mkdir = 9 => "MKDIR",
    Unlink = 10 => "UNLINK",
    Rmdir = 11 => "RMDIR",
    Rename = 12 => "RENAME",
    Open = 14 => "OPEN",
    Read = 15 => "READ",
    Write = 16 => "WRITE",
    Statfs = 17 => "STATFS",
    Release = 18 => "RELEASE",
    Getxattr = 22 => "GETXATTR",
    Listxattr = 23 => "LISTXATTR",
    Flush = 25 => "FLUSH",
    Init = 26 => "INIT",
    Opendir = 27 => "OPENDIR",
    Readdir = 28 => "READDIR",
    Releasedir = 29 => "RELEASEDIR",
    Create = 35 => "CREATE",
    Interrupt = 36 => "INTERRUPT",
    Destroy = 38 => "DESTROY",
    BatchForget = 42 => "BATCH_FORGET",
    Rename2 = 45 => "RENAME2",
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
