//! MT command catalogue
//!
//! Each command is declared once with its `(subsystem, type, id)` triple and
//! typed field list; the `znp_command!` macro derives the wire codec from
//! the declaration. Adding a command is data-only.

use bytes::{Buf, BufMut};

use crate::frame::MtFrame;
use crate::types::{
    CommandType, IeeeAddr, NwkAddr, ProtocolError, ProtocolViolation, Subsystem, ZnpStatus,
};

/// Field-level wire codec, little-endian throughout
pub trait Wire: Sized {
    fn put(&self, buf: &mut Vec<u8>);
    fn take(buf: &mut &[u8]) -> Option<Self>;
}

impl Wire for u8 {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u8(*self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        (buf.remaining() >= 1).then(|| buf.get_u8())
    }
}

impl Wire for i8 {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_i8(*self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        (buf.remaining() >= 1).then(|| buf.get_i8())
    }
}

impl Wire for u16 {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(*self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        (buf.remaining() >= 2).then(|| buf.get_u16_le())
    }
}

impl Wire for u32 {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(*self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        (buf.remaining() >= 4).then(|| buf.get_u32_le())
    }
}

impl Wire for u64 {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(*self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        (buf.remaining() >= 8).then(|| buf.get_u64_le())
    }
}

impl Wire for bool {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u8(u8::from(*self));
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        u8::take(buf).map(|v| v != 0)
    }
}

impl Wire for IeeeAddr {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.0);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        u64::take(buf).map(IeeeAddr)
    }
}

impl Wire for NwkAddr {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.0);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        u16::take(buf).map(NwkAddr)
    }
}

impl Wire for ZnpStatus {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.as_byte());
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        u8::take(buf).map(ZnpStatus::from_byte)
    }
}

impl<const N: usize> Wire for [u8; N] {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < N {
            return None;
        }
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        Some(out)
    }
}

/// Counted list: u8 element count followed by the elements
impl<T: Wire> Wire for Vec<T> {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.len() as u8);
        for item in self {
            item.put(buf);
        }
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        let count = u8::take(buf)? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::take(buf)?);
        }
        Some(out)
    }
}

/// Byte string with a u16 length prefix (extended AF/NV commands)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LongBytes(pub Vec<u8>);

impl Wire for LongBytes {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.0.len() as u16);
        buf.put_slice(&self.0);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        let len = u16::take(buf)? as usize;
        if buf.remaining() < len {
            return None;
        }
        let mut out = vec![0u8; len];
        buf.copy_to_slice(&mut out);
        Some(LongBytes(out))
    }
}

/// Optional trailing field: absent when the payload ends early
///
/// Newer firmware appends fields to some responses; older images simply
/// stop short.
impl<T: Wire> Wire for Option<T> {
    fn put(&self, buf: &mut Vec<u8>) {
        if let Some(inner) = self {
            inner.put(buf);
        }
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        if buf.has_remaining() {
            T::take(buf).map(Some)
        } else {
            Some(None)
        }
    }
}

/// A catalogued MT command
pub trait MtCommand: Sized + Send + 'static {
    const SUBSYSTEM: Subsystem;
    const CMD_TYPE: CommandType;
    const ID: u8;
    const NAME: &'static str;

    fn to_payload(&self) -> Vec<u8>;
    fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError>;

    fn to_frame(&self) -> MtFrame {
        MtFrame::new(Self::SUBSYSTEM, Self::CMD_TYPE, Self::ID, self.to_payload())
    }

    /// Whether `frame` carries this command
    fn matches(frame: &MtFrame) -> bool {
        frame.subsystem == Self::SUBSYSTEM
            && frame.cmd_type == Self::CMD_TYPE
            && frame.id == Self::ID
    }

    fn from_frame(frame: &MtFrame) -> Result<Self, ProtocolError> {
        if !Self::matches(frame) {
            return Err(ProtocolViolation::UnknownCommand {
                cmd0: frame.cmd0(),
                cmd1: frame.id,
            }
            .into());
        }
        Self::from_payload(&frame.payload)
    }
}

/// SREQ with a paired SRSP
pub trait SyncRequest: MtCommand {
    type Response: MtCommand;
}

/// SRSP carrying a firmware status byte
pub trait StatusReply: MtCommand {
    fn status(&self) -> ZnpStatus;
}

/// Outbound fire-and-forget AREQ
pub trait AsyncRequest: MtCommand {}

/// Unsolicited AREQ indication
pub trait Indication: MtCommand {}

pub(crate) fn field_decode_error<C: MtCommand>(payload: &[u8]) -> ProtocolError {
    ProtocolViolation::FieldDecode {
        command: C::NAME,
        payload: hex::encode(payload),
    }
    .into()
}

/// Declare an MT command and derive its wire codec
macro_rules! znp_command {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $subsys:ident / $cmd_type:ident / $id:literal {
            $($(#[$fmeta:meta])* pub $field:ident : $ftype:ty,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ftype,)*
        }

        impl $crate::cmd::MtCommand for $name {
            const SUBSYSTEM: $crate::types::Subsystem = $crate::types::Subsystem::$subsys;
            const CMD_TYPE: $crate::types::CommandType = $crate::types::CommandType::$cmd_type;
            const ID: u8 = $id;
            const NAME: &'static str = concat!(stringify!($subsys), ".", stringify!($name));

            fn to_payload(&self) -> Vec<u8> {
                #[allow(unused_mut)]
                let mut buf = Vec::new();
                $($crate::cmd::Wire::put(&self.$field, &mut buf);)*
                buf
            }

            #[allow(unused_variables, unused_mut)]
            fn from_payload(payload: &[u8]) -> Result<Self, $crate::types::ProtocolError> {
                let mut buf = payload;
                let parsed = (|| {
                    Some(Self {
                        $($field: $crate::cmd::Wire::take(&mut buf)?,)*
                    })
                })();
                parsed.ok_or_else(|| $crate::cmd::field_decode_error::<Self>(payload))
            }
        }
    };
}

/// Declare a status-only SRSP for a request
macro_rules! status_rsp {
    ($(#[$meta:meta])* pub struct $name:ident : $subsys:ident / $id:literal) => {
        znp_command! {
            $(#[$meta])*
            pub struct $name: $subsys/Srsp/$id {
                pub status: $crate::types::ZnpStatus,
            }
        }

        impl $crate::cmd::StatusReply for $name {
            fn status(&self) -> $crate::types::ZnpStatus {
                self.status
            }
        }
    };
}

/// Declare a plain record used inside command payloads
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$fmeta:meta])* pub $field:ident : $ftype:ty,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ftype,)*
        }

        impl $crate::cmd::Wire for $name {
            fn put(&self, buf: &mut Vec<u8>) {
                $($crate::cmd::Wire::put(&self.$field, buf);)*
            }
            fn take(buf: &mut &[u8]) -> Option<Self> {
                Some(Self {
                    $($field: $crate::cmd::Wire::take(buf)?,)*
                })
            }
        }
    };
}

pub mod af;
pub mod app_cnf;
pub mod sys;
pub mod util;
pub mod zdo;
