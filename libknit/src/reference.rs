//! The results of resolving directives. References are constructed once per resolved directive
//! and are immutable afterwards.

use crate::error::Result;
use crate::member::parameter_slots;
use crate::name::ClassName;
use bitflags::bitflags;
use std::fmt::Display;

/// How a resolved method gets invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Static,
    Virtual,
    /// Direct, non-virtual dispatch on the current instance. Used for private instance methods.
    Special,
    Interface,
}

/// How a resolved field gets read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldAccess {
    Static,
    Instance,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReferenceFlags: u8 {
        /// Resolved against the referring unit's own declarations rather than an external owner.
        const LOCAL = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodReference {
    owner: ClassName,
    /// Name and descriptor, e.g. `f(I)V`.
    member: String,
    kind: InvokeKind,
    flags: ReferenceFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldReference {
    owner: ClassName,
    name: String,
    field_type: String,
    access: FieldAccess,
    flags: ReferenceFlags,
}

impl InvokeKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            InvokeKind::Static => "invokestatic",
            InvokeKind::Virtual => "invokevirtual",
            InvokeKind::Special => "invokespecial",
            InvokeKind::Interface => "invokeinterface",
        }
    }

    pub fn needs_receiver(self) -> bool {
        !matches!(self, InvokeKind::Static)
    }
}

impl FieldAccess {
    pub fn mnemonic(self) -> &'static str {
        match self {
            FieldAccess::Static => "getstatic",
            FieldAccess::Instance => "getfield",
        }
    }
}

impl MethodReference {
    pub(crate) fn new(
        owner: ClassName,
        member: String,
        kind: InvokeKind,
        flags: ReferenceFlags,
    ) -> MethodReference {
        MethodReference {
            owner,
            member,
            kind,
            flags,
        }
    }

    pub fn owner(&self) -> &ClassName {
        &self.owner
    }

    /// The method name followed by its descriptor.
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn kind(&self) -> InvokeKind {
        self.kind
    }

    pub fn flags(&self) -> ReferenceFlags {
        self.flags
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(ReferenceFlags::LOCAL)
    }

    /// The descriptor part of the member, e.g. `(I)V`.
    pub fn descriptor(&self) -> &str {
        self.member
            .find('(')
            .map_or("", |paren| &self.member[paren..])
    }

    /// The argument count operand for interface dispatch: the parameter slots plus one for the
    /// receiver.
    pub fn interface_argument_count(&self) -> Result<u16> {
        Ok(parameter_slots(self.descriptor())? + 1)
    }
}

impl FieldReference {
    pub(crate) fn new(
        owner: ClassName,
        name: String,
        field_type: String,
        access: FieldAccess,
        flags: ReferenceFlags,
    ) -> FieldReference {
        FieldReference {
            owner,
            name,
            field_type,
            access,
            flags,
        }
    }

    pub fn owner(&self) -> &ClassName {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &str {
        &self.field_type
    }

    pub fn access(&self) -> FieldAccess {
        self.access
    }

    pub fn flags(&self) -> ReferenceFlags {
        self.flags
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(ReferenceFlags::LOCAL)
    }
}

/// Displays as the fully qualified symbolic reference, e.g. `pkg/A/f(I)V`.
impl Display for MethodReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.member)
    }
}

/// Displays as the fully qualified symbolic reference, e.g. `pkg/A/count I`.
impl Display for FieldReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.owner, self.name, self.field_type)
    }
}
