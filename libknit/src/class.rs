use crate::member::FieldDescriptor;
use crate::member::MethodDescriptor;
use crate::member::Modifiers;
use crate::name::ClassName;
use foldhash::HashMap;
use std::collections::hash_map;

/// An immutable snapshot of one class-like unit. Lookup maps are built once by `new` and keyed by
/// unqualified signature. When two members share a signature, the one declared first wins.
#[derive(Debug)]
pub struct ClassDescriptor {
    name: ClassName,
    modifiers: Modifiers,
    super_name: Option<ClassName>,
    interfaces: Vec<ClassName>,
    methods: Vec<MethodDescriptor>,
    fields: Vec<FieldDescriptor>,
    methods_by_signature: HashMap<String, usize>,
    fields_by_signature: HashMap<String, usize>,
}

/// The parts of a class declaration other than its members.
#[derive(Debug, Clone)]
pub struct ClassHeader {
    pub name: ClassName,
    pub modifiers: Modifiers,
    pub super_name: Option<ClassName>,
    pub interfaces: Vec<ClassName>,
}

impl ClassDescriptor {
    pub fn new(
        header: ClassHeader,
        methods: Vec<MethodDescriptor>,
        fields: Vec<FieldDescriptor>,
    ) -> ClassDescriptor {
        let methods_by_signature = index_by(methods.iter().map(MethodDescriptor::signature));
        let fields_by_signature = index_by(fields.iter().map(FieldDescriptor::signature));
        ClassDescriptor {
            name: header.name,
            modifiers: header.modifiers,
            super_name: header.super_name,
            interfaces: header.interfaces,
            methods,
            fields,
            methods_by_signature,
            fields_by_signature,
        }
    }

    pub fn name(&self) -> &ClassName {
        &self.name
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn is_interface(&self) -> bool {
        self.modifiers.is_interface()
    }

    pub fn super_name(&self) -> Option<&ClassName> {
        self.super_name.as_ref()
    }

    pub fn interfaces(&self) -> &[ClassName] {
        &self.interfaces
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Looks up a method by unqualified signature, e.g. `f(I)V`.
    pub fn method(&self, signature: &str) -> Option<&MethodDescriptor> {
        self.methods_by_signature
            .get(signature)
            .map(|&index| &self.methods[index])
    }

    /// Looks up a field by unqualified signature, e.g. `count I`.
    pub fn field(&self, signature: &str) -> Option<&FieldDescriptor> {
        self.fields_by_signature
            .get(signature)
            .map(|&index| &self.fields[index])
    }

    pub fn public_method(&self, signature: &str) -> Option<&MethodDescriptor> {
        self.method(signature)
            .filter(|method| method.modifiers().is_public())
    }

    pub fn public_field(&self, signature: &str) -> Option<&FieldDescriptor> {
        self.field(signature)
            .filter(|field| field.modifiers().is_public())
    }

    /// The classes that members may be inherited from: the superclass, then the interfaces.
    pub(crate) fn supertypes(&self) -> impl Iterator<Item = &ClassName> {
        self.super_name.iter().chain(&self.interfaces)
    }
}

fn index_by(signatures: impl Iterator<Item = String>) -> HashMap<String, usize> {
    let mut index = HashMap::default();
    for (i, signature) in signatures.enumerate() {
        if let hash_map::Entry::Vacant(entry) = index.entry(signature) {
            entry.insert(i);
        }
    }
    index
}
