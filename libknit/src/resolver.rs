//! Binds member signatures to the classes that declare them.
//!
//! The resolver is shared by all resolution passes in a job, so everything it mutates after
//! construction lives in concurrent maps: loaded library classes and memoized results of
//! unqualified lookups. Memoized results are a pure function of the signature text, so if two
//! threads race to fill the same entry, they compute the same value.

use crate::class::ClassDescriptor;
use crate::error::LinkError;
use crate::error::Result;
use crate::error::warning;
use crate::member::MemberKind;
use crate::member::MemberSignature;
use crate::metadata::LookupError;
use crate::metadata::MetadataLoader;
use crate::name::ClassName;
use crate::reference::FieldAccess;
use crate::reference::FieldReference;
use crate::reference::InvokeKind;
use crate::reference::MethodReference;
use crate::reference::ReferenceFlags;
use crate::resolution_bail;
use dashmap::DashMap;
use foldhash::HashMap;
use foldhash::HashSet;
use std::collections::hash_map;
use std::sync::Arc;

/// A class declared by one of the job's sources.
#[derive(Debug, Clone)]
pub struct DiscoveredClass {
    pub source: String,
    pub class: Arc<ClassDescriptor>,
}

pub struct Resolver {
    /// Classes declared by the job's sources, keyed by name.
    job_classes: HashMap<ClassName, Arc<ClassDescriptor>>,

    /// Where unqualified signatures are looked up: the job's sources, then its libraries, each in
    /// the order they were supplied.
    search_order: Vec<Arc<ClassDescriptor>>,

    loader: Arc<dyn MetadataLoader>,

    /// Classes obtained from `loader`, including the job's libraries.
    loaded: DashMap<ClassName, Arc<ClassDescriptor>>,

    methods: DashMap<String, MethodReference>,
    fields: DashMap<String, FieldReference>,
    unresolved_target: Option<ClassName>,
}

impl Resolver {
    /// Builds a resolver from the classes discovered in the job's sources and the job's already
    /// loaded libraries. Fails if two sources declare the same class. A library with the same
    /// name as a source's class is ignored, with a warning.
    pub fn new(
        discovered: Vec<DiscoveredClass>,
        libraries: Vec<Arc<ClassDescriptor>>,
        loader: Arc<dyn MetadataLoader>,
        unresolved_target: Option<ClassName>,
    ) -> Result<Resolver> {
        let mut declared_by: HashMap<ClassName, String> = HashMap::default();
        let mut job_classes = HashMap::default();
        let mut search_order = Vec::with_capacity(discovered.len() + libraries.len());

        for DiscoveredClass { source, class } in discovered {
            match declared_by.entry(class.name().clone()) {
                hash_map::Entry::Occupied(entry) => {
                    return Err(LinkError::DuplicateClass {
                        class: class.name().to_string(),
                        first: entry.get().clone(),
                        second: source,
                    }
                    .into());
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(source);
                }
            }
            job_classes.insert(class.name().clone(), class.clone());
            search_order.push(class);
        }

        let loaded = DashMap::new();
        for library in libraries {
            if let Some(source) = declared_by.get(library.name()) {
                warning(&format!(
                    "library class `{}` is shadowed by the declaration in `{source}`",
                    library.name()
                ));
                continue;
            }
            loaded.insert(library.name().clone(), library.clone());
            search_order.push(library);
        }

        Ok(Resolver {
            job_classes,
            search_order,
            loader,
            loaded,
            methods: DashMap::new(),
            fields: DashMap::new(),
            unresolved_target,
        })
    }

    /// Looks up a class by name: the job's own classes first, then anything already loaded, then
    /// the metadata loader.
    pub fn class(&self, name: &ClassName) -> Result<Arc<ClassDescriptor>, LookupError> {
        if let Some(class) = self.job_classes.get(name) {
            return Ok(class.clone());
        }
        if let Some(class) = self.loaded.get(name) {
            return Ok(class.clone());
        }
        let class = self.loader.lookup(name)?;
        Ok(self.loaded.entry(name.clone()).or_insert(class).clone())
    }

    pub fn resolve_method(
        &self,
        signature: &str,
        referrer: &Arc<ClassDescriptor>,
    ) -> Result<MethodReference> {
        let parsed = MemberSignature::parse_method(signature)?;
        let member = parsed.unqualified(MemberKind::Method);
        if let Some(owner) = parsed.owner {
            let owner = ClassName::new(owner);
            let class = self.named_class(&owner, referrer, signature)?;
            let Some((declaring, is_static)) = self.find_inherited(&class, |class| {
                class
                    .public_method(&member)
                    .map(|method| method.modifiers().is_static())
            }) else {
                resolution_bail!("unable to resolve public member `{signature}`");
            };
            tracing::trace!(signature, declaring = %declaring, "Resolved qualified method");
            let kind = external_invoke_kind(is_static, &class);
            return Ok(MethodReference::new(
                owner,
                member,
                kind,
                ReferenceFlags::empty(),
            ));
        }

        if let Some(reference) = self.methods.get(signature) {
            return Ok(reference.clone());
        }
        let found = self.search_order.iter().find_map(|class| {
            let method = class.public_method(&member)?;
            let kind = external_invoke_kind(method.modifiers().is_static(), class);
            Some(MethodReference::new(
                class.name().clone(),
                member.clone(),
                kind,
                ReferenceFlags::empty(),
            ))
        });
        let reference = match (found, &self.unresolved_target) {
            (Some(reference), _) => reference,
            (None, Some(target)) => {
                tracing::debug!(signature, target = %target, "Using unresolved target");
                MethodReference::new(
                    target.clone(),
                    member,
                    InvokeKind::Static,
                    ReferenceFlags::empty(),
                )
            }
            (None, None) => resolution_bail!("unable to resolve public member `{signature}`"),
        };
        self.methods.insert(signature.to_owned(), reference.clone());
        Ok(reference)
    }

    pub fn resolve_field(
        &self,
        signature: &str,
        referrer: &Arc<ClassDescriptor>,
    ) -> Result<FieldReference> {
        let parsed = MemberSignature::parse_field(signature)?;
        let member = parsed.unqualified(MemberKind::Field);
        if let Some(owner) = parsed.owner {
            let owner = ClassName::new(owner);
            let class = self.named_class(&owner, referrer, signature)?;
            let Some((_, is_static)) = self.find_inherited(&class, |class| {
                class
                    .public_field(&member)
                    .map(|field| field.modifiers().is_static())
            }) else {
                resolution_bail!("unable to resolve public member `{signature}`");
            };
            return Ok(FieldReference::new(
                owner,
                parsed.name.to_owned(),
                parsed.descriptor.to_owned(),
                field_access(is_static),
                ReferenceFlags::empty(),
            ));
        }

        if let Some(reference) = self.fields.get(signature) {
            return Ok(reference.clone());
        }
        let found = self.search_order.iter().find_map(|class| {
            let field = class.public_field(&member)?;
            Some(FieldReference::new(
                class.name().clone(),
                parsed.name.to_owned(),
                parsed.descriptor.to_owned(),
                field_access(field.modifiers().is_static()),
                ReferenceFlags::empty(),
            ))
        });
        let reference = match (found, &self.unresolved_target) {
            (Some(reference), _) => reference,
            (None, Some(target)) => {
                tracing::debug!(signature, target = %target, "Using unresolved target");
                FieldReference::new(
                    target.clone(),
                    parsed.name.to_owned(),
                    parsed.descriptor.to_owned(),
                    FieldAccess::Static,
                    ReferenceFlags::empty(),
                )
            }
            (None, None) => resolution_bail!("unable to resolve public member `{signature}`"),
        };
        self.fields.insert(signature.to_owned(), reference.clone());
        Ok(reference)
    }

    /// Resolves a method against the referrer's own declarations, whatever their visibility.
    pub fn resolve_local_method(
        &self,
        signature: &str,
        referrer: &ClassDescriptor,
    ) -> Result<MethodReference> {
        let parsed = MemberSignature::parse_method(signature)?;
        check_local(&parsed, referrer, signature)?;
        let member = parsed.unqualified(MemberKind::Method);
        let Some(method) = referrer.method(&member) else {
            resolution_bail!(
                "unable to resolve local member `{signature}` in `{}`",
                referrer.name()
            );
        };
        let modifiers = method.modifiers();
        let kind = if modifiers.is_static() {
            InvokeKind::Static
        } else if modifiers.is_private() {
            InvokeKind::Special
        } else {
            InvokeKind::Virtual
        };
        Ok(MethodReference::new(
            referrer.name().clone(),
            member,
            kind,
            ReferenceFlags::LOCAL,
        ))
    }

    pub fn resolve_local_field(
        &self,
        signature: &str,
        referrer: &ClassDescriptor,
    ) -> Result<FieldReference> {
        let parsed = MemberSignature::parse_field(signature)?;
        check_local(&parsed, referrer, signature)?;
        let Some(field) = referrer.field(&parsed.unqualified(MemberKind::Field)) else {
            resolution_bail!(
                "unable to resolve local member `{signature}` in `{}`",
                referrer.name()
            );
        };
        Ok(FieldReference::new(
            referrer.name().clone(),
            parsed.name.to_owned(),
            parsed.descriptor.to_owned(),
            field_access(field.modifiers().is_static()),
            ReferenceFlags::LOCAL,
        ))
    }

    fn named_class(
        &self,
        owner: &ClassName,
        referrer: &Arc<ClassDescriptor>,
        signature: &str,
    ) -> Result<Arc<ClassDescriptor>> {
        if owner == referrer.name() {
            return Ok(referrer.clone());
        }
        self.class(owner).map_err(|error| {
            LinkError::Resolution(format!(
                "unable to resolve public member `{signature}`: {error}"
            ))
            .into()
        })
    }

    /// Searches `class` and then its supertypes for a member, using `find` to check each class.
    /// Supertypes that can't be loaded are skipped. Returns the class that declares the member
    /// together with whatever `find` returned for it.
    fn find_inherited<T>(
        &self,
        class: &Arc<ClassDescriptor>,
        find: impl Fn(&ClassDescriptor) -> Option<T>,
    ) -> Option<(ClassName, T)> {
        let mut visited = HashSet::default();
        let mut pending = vec![class.clone()];
        while let Some(class) = pending.pop() {
            if !visited.insert(class.name().clone()) {
                continue;
            }
            if let Some(found) = find(&class) {
                return Some((class.name().clone(), found));
            }
            // Push in reverse so that the superclass gets searched before the interfaces.
            let supertypes: Vec<_> = class.supertypes().cloned().collect();
            for name in supertypes.into_iter().rev() {
                match self.class(&name) {
                    Ok(supertype) => pending.push(supertype),
                    Err(error) => tracing::debug!(class = %name, %error, "Skipping supertype"),
                }
            }
        }
        None
    }
}

fn check_local(parsed: &MemberSignature, referrer: &ClassDescriptor, signature: &str) -> Result {
    if referrer.is_interface() {
        resolution_bail!(
            "cannot resolve local member `{signature}` in interface `{}`",
            referrer.name()
        );
    }
    if let Some(owner) = parsed.owner {
        if ClassName::new(owner) != *referrer.name() {
            resolution_bail!(
                "local member `{signature}` must belong to `{}`",
                referrer.name()
            );
        }
    }
    Ok(())
}

fn external_invoke_kind(is_static: bool, owner: &ClassDescriptor) -> InvokeKind {
    if is_static {
        InvokeKind::Static
    } else if owner.is_interface() {
        InvokeKind::Interface
    } else {
        InvokeKind::Virtual
    }
}

fn field_access(is_static: bool) -> FieldAccess {
    if is_static {
        FieldAccess::Static
    } else {
        FieldAccess::Instance
    }
}
