//! Interface descriptions.
//!
//! The `#[duorpc::interface]` macro reduces a trait declaration to a constant
//! slice of [`MethodDesc`] entries: one per method, in declaration order,
//! carrying the name-derived identifier and the method's return shape. Both
//! the generated client stubs and the server dispatch table are driven by
//! this description.

use crate::MethodId;

/// Upper bound on the number of parameters an interface method may declare.
pub const MAX_PARAMS: usize = 10;

/// The three supported method return shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// `async fn … -> Result<T>`: awaited call returning a value.
    AsyncValue,
    /// `async fn … -> Result<()>`: awaited call returning no value.
    AsyncUnit,
    /// `fn … -> Result<()>`: fire-and-forget, no reply ever produced.
    Oneway,
}

/// Compile-time description of one interface method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDesc {
    pub name: &'static str,
    pub id: MethodId,
    pub shape: ReturnShape,
}

impl MethodDesc {
    #[must_use]
    pub const fn new(name: &'static str, shape: ReturnShape) -> Self {
        Self {
            name,
            id: MethodId::from_name(name),
            shape,
        }
    }
}

/// Validates a generated method table in const context: the interface must
/// have at least one method and no two method names may hash to the same
/// identifier. Violations abort compilation when the table is first used.
#[must_use]
pub const fn checked(methods: &'static [MethodDesc]) -> &'static [MethodDesc] {
    assert!(!methods.is_empty(), "interface must declare at least one method");
    let mut i = 0;
    while i < methods.len() {
        assert!(!methods[i].id.is_unset(), "method identifier 0 is reserved");
        let mut j = i + 1;
        while j < methods.len() {
            assert!(
                methods[i].id.raw() != methods[j].id.raw(),
                "method identifier collision within interface"
            );
            j += 1;
        }
        i += 1;
    }
    methods
}
