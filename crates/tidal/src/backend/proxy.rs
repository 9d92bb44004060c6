//! Host functions callable from compiled code.
//!
//! Every proxy takes up to six `u64` arguments and returns a `u64`, values
//! travel in their canonical representation. Proxies are registered once and
//! addressed by their [`ProxyId`] inside the IR, the backends resolve the id
//! to the function's address when lowering a call.

use crate::{ir::ProxyId, types::Type};
use std::{collections::HashMap, fmt};

pub type Proxy0 = unsafe extern "C" fn() -> u64;
pub type Proxy1 = unsafe extern "C" fn(u64) -> u64;
pub type Proxy2 = unsafe extern "C" fn(u64, u64) -> u64;
pub type Proxy3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
pub type Proxy4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;
pub type Proxy5 = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;
pub type Proxy6 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

/// A proxy function pointer, tagged with its arity
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ProxyPtr {
    A0(Proxy0),
    A1(Proxy1),
    A2(Proxy2),
    A3(Proxy3),
    A4(Proxy4),
    A5(Proxy5),
    A6(Proxy6),
}

impl ProxyPtr {
    pub const fn arity(self) -> usize {
        match self {
            Self::A0(_) => 0,
            Self::A1(_) => 1,
            Self::A2(_) => 2,
            Self::A3(_) => 3,
            Self::A4(_) => 4,
            Self::A5(_) => 5,
            Self::A6(_) => 6,
        }
    }

    /// The address of the function, used by code generating backends
    pub fn address(self) -> usize {
        match self {
            Self::A0(f) => f as usize,
            Self::A1(f) => f as usize,
            Self::A2(f) => f as usize,
            Self::A3(f) => f as usize,
            Self::A4(f) => f as usize,
            Self::A5(f) => f as usize,
            Self::A6(f) => f as usize,
        }
    }

    /// Calls the proxy.
    ///
    /// # Safety
    ///
    /// `args` must satisfy the proxy's own safety contract, which usually
    /// means that the handles among them are alive.
    ///
    /// # Panics
    ///
    /// Panics if `args` doesn't match the proxy's arity.
    pub unsafe fn invoke(self, args: &[u64]) -> u64 {
        match (self, args) {
            (Self::A0(f), []) => f(),
            (Self::A1(f), &[a]) => f(a),
            (Self::A2(f), &[a, b]) => f(a, b),
            (Self::A3(f), &[a, b, c]) => f(a, b, c),
            (Self::A4(f), &[a, b, c, d]) => f(a, b, c, d),
            (Self::A5(f), &[a, b, c, d, e]) => f(a, b, c, d, e),
            (Self::A6(f), &[a, b, c, d, e, g]) => f(a, b, c, d, e, g),
            _ => panic!(
                "called a proxy taking {} arguments with {}",
                self.arity(),
                args.len(),
            ),
        }
    }
}

impl fmt::Debug for ProxyPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyPtr({}, {:#x})", self.arity(), self.address())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyDef {
    pub name: &'static str,
    pub ptr: ProxyPtr,
    pub ret: Option<Type>,
}

/// The set of proxies available to compiled code
#[derive(Debug, Clone, Default)]
pub struct ProxyRegistry {
    proxies: Vec<ProxyDef>,
    by_name: HashMap<&'static str, ProxyId>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a proxy, registering the same name twice returns the id of
    /// the first registration.
    pub fn register(&mut self, name: &'static str, ptr: ProxyPtr, ret: Option<Type>) -> ProxyId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }

        let id = ProxyId(self.proxies.len() as u32);
        self.proxies.push(ProxyDef { name, ptr, ret });
        self.by_name.insert(name, id);
        id
    }

    pub fn get(&self, id: ProxyId) -> Option<&ProxyDef> {
        self.proxies.get(id.0 as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<ProxyId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProxyId, &ProxyDef)> {
        self.proxies
            .iter()
            .enumerate()
            .map(|(index, def)| (ProxyId(index as u32), def))
    }
}

#[cfg(test)]
pub(crate) mod test_proxies {
    pub unsafe extern "C" fn add3(a: u64, b: u64, c: u64) -> u64 {
        a.wrapping_add(b).wrapping_add(c)
    }

    pub unsafe extern "C" fn double(a: u64) -> u64 {
        a.wrapping_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::{test_proxies::*, *};

    #[test]
    fn stable_ids() {
        let mut registry = ProxyRegistry::new();
        let add = registry.register("add3", ProxyPtr::A3(add3), Some(Type::U64));
        let dbl = registry.register("double", ProxyPtr::A1(double), Some(Type::U64));
        assert_eq!(add, ProxyId(0));
        assert_eq!(dbl, ProxyId(1));
        assert_eq!(
            registry.register("add3", ProxyPtr::A3(add3), Some(Type::U64)),
            add
        );
        assert_eq!(registry.lookup("double"), Some(dbl));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn invoke_checks_arity() {
        let ptr = ProxyPtr::A3(add3);
        assert_eq!(unsafe { ptr.invoke(&[1, 2, 3]) }, 6);
        let result = std::panic::catch_unwind(|| unsafe { ptr.invoke(&[1]) });
        assert!(result.is_err());
    }
}
