//! # Composite Manager
//!
//! Transactional grouping of handles with all-or-nothing allocation and
//! LIFO teardown. Members close in reverse insertion order; a failed
//! allocation unwinds everything already added and parks the composite in
//! `Failed`. Named members support typed lookup.
//!
//! One mutex guards the member sequence and the name map. Member cleanup
//! callbacks (installed so an externally closed handle is forgotten)
//! suppress themselves while the composite itself is tearing down.

use crate::error::{ResourceError, Result};
use crate::handle::TrackedResource;
use crate::types::ResourceType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a composite
///
/// `Initializing -> Active -> Closed` is the happy path;
/// `-> RollingBack -> Failed` on allocation or transaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompositeState {
    Initializing = 0,
    Active = 1,
    RollingBack = 2,
    Closed = 3,
    Failed = 4,
}

impl CompositeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Active,
            2 => Self::RollingBack,
            3 => Self::Closed,
            _ => Self::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Active => "Active",
            Self::RollingBack => "RollingBack",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        }
    }
}

struct CompositeInner {
    /// Insertion order; teardown walks this in reverse
    handles: Vec<Arc<dyn TrackedResource>>,
    /// Caller-supplied name -> handle ID
    names: HashMap<String, String>,
}

/// Transactional group of owned handles
pub struct CompositeResource {
    label: String,
    state: AtomicU8,
    /// Set while the composite closes its own members; member callbacks
    /// check it before locking so self-teardown never re-enters
    tearing_down: AtomicBool,
    inner: Mutex<CompositeInner>,
    failure: Mutex<Option<String>>,
}

impl CompositeResource {
    pub fn new<L: Into<String>>(label: L) -> Arc<Self> {
        let label = label.into();
        log::debug!("Created composite '{}'", label);
        Arc::new(Self {
            label,
            state: AtomicU8::new(CompositeState::Initializing as u8),
            tearing_down: AtomicBool::new(false),
            inner: Mutex::new(CompositeInner {
                handles: Vec::new(),
                names: HashMap::new(),
            }),
            failure: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CompositeState {
        CompositeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of member handles
    pub fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cause recorded by the rollback that failed this composite
    pub fn failure_cause(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Append a handle to the group
    pub fn add(self: &Arc<Self>, handle: Arc<dyn TrackedResource>) -> Result<()> {
        self.add_inner(None, handle)
    }

    /// Append a handle under a caller-supplied name
    pub fn add_named<N: Into<String>>(
        self: &Arc<Self>,
        name: N,
        handle: Arc<dyn TrackedResource>,
    ) -> Result<()> {
        self.add_inner(Some(name.into()), handle)
    }

    fn add_inner(self: &Arc<Self>, name: Option<String>, handle: Arc<dyn TrackedResource>) -> Result<()> {
        self.check_accepting("add")?;

        // If something else closes this member, the composite forgets it.
        let weak = Arc::downgrade(self);
        let member_id = handle.id().to_string();
        handle.set_cleanup_callback(Box::new(move || {
            if let Some(composite) = weak.upgrade() {
                composite.forget(&member_id);
            }
        }));

        let mut inner = self.inner.lock();
        if let Some(name) = name {
            if inner.names.contains_key(&name) {
                return Err(ResourceError::invalid_argument(
                    "name",
                    format!("'{}' already present in composite '{}'", name, self.label),
                ));
            }
            inner.names.insert(name, handle.id().to_string());
        }
        inner.handles.push(handle);
        Ok(())
    }

    /// Run a producer and adopt its handle; rolls back everything on error
    pub fn allocate<F>(self: &Arc<Self>, produce: F) -> Result<Arc<dyn TrackedResource>>
    where
        F: FnOnce() -> Result<Arc<dyn TrackedResource>>,
    {
        self.allocate_inner(None, produce)
    }

    /// Named variant of [`CompositeResource::allocate`]
    pub fn allocate_named<N, F>(self: &Arc<Self>, name: N, produce: F) -> Result<Arc<dyn TrackedResource>>
    where
        N: Into<String>,
        F: FnOnce() -> Result<Arc<dyn TrackedResource>>,
    {
        self.allocate_inner(Some(name.into()), produce)
    }

    fn allocate_inner<F>(
        self: &Arc<Self>,
        name: Option<String>,
        produce: F,
    ) -> Result<Arc<dyn TrackedResource>>
    where
        F: FnOnce() -> Result<Arc<dyn TrackedResource>>,
    {
        self.check_accepting("allocate")?;

        match produce().and_then(|handle| {
            self.add_inner(name, handle.clone())?;
            Ok(handle)
        }) {
            Ok(handle) => Ok(handle),
            Err(cause) => {
                log::warn!(
                    "Allocation inside composite '{}' failed, rolling back: {}",
                    self.label,
                    cause
                );
                self.rollback_from(0, &cause.to_string());
                Err(ResourceError::alloc_failed(cause.to_string()))
            }
        }
    }

    /// Run a block of additions with partial-rollback semantics
    ///
    /// On failure only the handles added during the block unwind, in
    /// reverse order, and the composite parks in `Failed`. On success the
    /// composite is `Active`.
    pub fn transaction<F>(self: &Arc<Self>, block: F) -> Result<()>
    where
        F: FnOnce(&Arc<Self>) -> Result<()>,
    {
        self.check_accepting("transaction")?;
        let mark = self.inner.lock().handles.len();

        match block(self) {
            Ok(()) => {
                self.state
                    .store(CompositeState::Active as u8, Ordering::Release);
                Ok(())
            }
            Err(cause) => {
                log::warn!(
                    "Transaction on composite '{}' failed, rolling back {} member(s): {}",
                    self.label,
                    self.inner.lock().handles.len().saturating_sub(mark),
                    cause
                );
                self.rollback_from(mark, &cause.to_string());
                Err(cause)
            }
        }
    }

    /// Look up a member by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn TrackedResource>> {
        let inner = self.inner.lock();
        let id = inner.names.get(name)?;
        inner
            .handles
            .iter()
            .find(|handle| handle.id() == id)
            .cloned()
    }

    /// Look up a member by name, insisting on its type tag
    pub fn require(&self, name: &str, expected: ResourceType) -> Result<Arc<dyn TrackedResource>> {
        let handle = self.get(name).ok_or_else(|| {
            ResourceError::invalid_argument(
                "name",
                format!("no member '{}' in composite '{}'", name, self.label),
            )
        })?;
        if handle.type_tag() != expected {
            return Err(ResourceError::invalid_argument(
                "expected",
                format!(
                    "member '{}' is {}, not {}",
                    name,
                    handle.type_tag(),
                    expected
                ),
            ));
        }
        Ok(handle)
    }

    /// Close every member in reverse insertion order; idempotent
    ///
    /// All member failures are aggregated into one `CloseFailed`.
    pub fn close(&self) -> Result<()> {
        let previous = self.state();
        if previous == CompositeState::Closed {
            return Ok(());
        }
        self.state
            .store(CompositeState::Closed as u8, Ordering::Release);

        let causes = self.teardown_from(0);
        log::debug!("Closed composite '{}' (was {})", self.label, previous.as_str());

        if causes.is_empty() {
            Ok(())
        } else {
            Err(ResourceError::CloseFailed { causes })
        }
    }

    /// Drop a member that something else already closed
    fn forget(&self, member_id: &str) {
        if self.tearing_down.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.handles.retain(|handle| handle.id() != member_id);
        inner.names.retain(|_, id| id != member_id);
        log::trace!(
            "Composite '{}' forgot externally closed member '{}'",
            self.label,
            member_id
        );
    }

    fn check_accepting(&self, operation: &str) -> Result<()> {
        let state = self.state();
        match state {
            CompositeState::Initializing | CompositeState::Active => Ok(()),
            _ => Err(ResourceError::invalid_state(
                format!("composite:{}", self.label),
                operation,
                "Initializing or Active",
                state.as_str(),
            )),
        }
    }

    /// Unwind members from `mark` onward and park in `Failed`
    fn rollback_from(&self, mark: usize, cause: &str) {
        self.state
            .store(CompositeState::RollingBack as u8, Ordering::Release);
        *self.failure.lock() = Some(cause.to_string());

        let causes = self.teardown_from(mark);
        if !causes.is_empty() {
            log::error!(
                "Rollback of composite '{}' hit {} close failure(s)",
                self.label,
                causes.len()
            );
        }

        self.state
            .store(CompositeState::Failed as u8, Ordering::Release);
    }

    /// Close members `mark..` in reverse order under the composite lock
    fn teardown_from(&self, mark: usize) -> Vec<String> {
        self.tearing_down.store(true, Ordering::Release);
        let mut causes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let removed: Vec<Arc<dyn TrackedResource>> =
                inner.handles.drain(mark..).collect();
            for handle in &removed {
                inner.names.retain(|_, id| id != handle.id());
            }
            for handle in removed.iter().rev() {
                if let Err(e) = handle.close() {
                    causes.push(format!("{}: {}", handle.id(), e));
                }
            }
        }
        self.tearing_down.store(false, Ordering::Release);
        causes
    }
}

impl Drop for CompositeResource {
    fn drop(&mut self) {
        if !matches!(self.state(), CompositeState::Closed | CompositeState::Failed) {
            if let Err(e) = self.close() {
                log::error!("Composite '{}' close on drop failed: {}", self.label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::handle::HandleCore;
    use crate::types::HandleState;

    struct OrderedHandle {
        core: HandleCore,
        tag: ResourceType,
        order: Arc<Mutex<Vec<String>>>,
        fail_close: bool,
    }

    impl OrderedHandle {
        fn new(tag: ResourceType, order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                core: HandleCore::new(tag),
                tag,
                order,
                fail_close: false,
            })
        }

        fn failing(order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                core: HandleCore::new(ResourceType::Event),
                tag: ResourceType::Event,
                order,
                fail_close: true,
            })
        }
    }

    impl TrackedResource for OrderedHandle {
        fn core(&self) -> &HandleCore {
            &self.core
        }

        fn type_tag(&self) -> ResourceType {
            self.tag
        }

        fn size_bytes(&self) -> usize {
            0
        }

        fn close(&self) -> Result<()> {
            self.core.close_with(|| {
                self.order.lock().push(self.id().to_string());
                if self.fail_close {
                    Err(ResourceError::invalid_argument("close", "forced failure"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[test]
    fn test_close_is_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("lifo");

        let a = OrderedHandle::new(ResourceType::Buffer, order.clone());
        let b = OrderedHandle::new(ResourceType::Buffer, order.clone());
        let c = OrderedHandle::new(ResourceType::Buffer, order.clone());
        composite.add(a.clone()).unwrap();
        composite.add(b.clone()).unwrap();
        composite.add(c.clone()).unwrap();

        composite.close().unwrap();
        let closed = order.lock().clone();
        assert_eq!(
            closed,
            vec![
                c.id().to_string(),
                b.id().to_string(),
                a.id().to_string()
            ]
        );
        assert_eq!(composite.state(), CompositeState::Closed);
        assert!(composite.is_empty());
    }

    #[test]
    fn test_failed_allocate_rolls_back_everything() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("rollback");

        let first = OrderedHandle::new(ResourceType::Texture, order.clone());
        let first_clone = first.clone();
        composite
            .allocate(move || Ok(first_clone as Arc<dyn TrackedResource>))
            .unwrap();
        assert_eq!(composite.len(), 1);

        let err = composite
            .allocate(|| Err(ResourceError::invalid_argument("produce", "boom")))
            .unwrap_err();
        assert!(matches!(err, ResourceError::AllocFailed { .. }));

        assert_eq!(composite.len(), 0);
        assert_eq!(composite.state(), CompositeState::Failed);
        assert_eq!(first.state(), HandleState::Closed);
        assert!(composite.failure_cause().unwrap().contains("boom"));
    }

    #[test]
    fn test_transaction_rolls_back_only_block_members() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("txn");

        let outside = OrderedHandle::new(ResourceType::Buffer, order.clone());
        composite.add(outside.clone()).unwrap();

        let inside = OrderedHandle::new(ResourceType::Buffer, order.clone());
        let inside_clone = inside.clone();
        let result = composite.transaction(move |group| {
            group.add(inside_clone)?;
            Err(ResourceError::invalid_argument("txn", "mid-block failure"))
        });
        assert!(result.is_err());

        assert_eq!(composite.state(), CompositeState::Failed);
        assert_eq!(inside.state(), HandleState::Closed);
        assert_eq!(outside.state(), HandleState::Allocated);
        assert_eq!(composite.len(), 1);

        composite.close().unwrap();
        assert_eq!(outside.state(), HandleState::Closed);
    }

    #[test]
    fn test_successful_transaction_activates() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("txn-ok");

        let member = OrderedHandle::new(ResourceType::Kernel, order);
        let member_clone = member.clone();
        composite
            .transaction(move |group| group.add(member_clone))
            .unwrap();

        assert_eq!(composite.state(), CompositeState::Active);
        assert_eq!(composite.len(), 1);
        composite.close().unwrap();
    }

    #[test]
    fn test_named_lookup_and_type_check() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("named");

        let program = OrderedHandle::new(ResourceType::ShaderProgram, order);
        composite.add_named("blur", program.clone()).unwrap();

        assert_eq!(composite.get("blur").unwrap().id(), program.id());
        assert!(composite.get("sharpen").is_none());

        composite
            .require("blur", ResourceType::ShaderProgram)
            .unwrap();
        let err = composite.require("blur", ResourceType::Kernel).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidArgument { .. }));

        composite.close().unwrap();
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("dup");
        composite
            .add_named("x", OrderedHandle::new(ResourceType::Buffer, order.clone()))
            .unwrap();
        assert!(composite
            .add_named("x", OrderedHandle::new(ResourceType::Buffer, order))
            .is_err());
        composite.close().unwrap();
    }

    #[test]
    fn test_external_close_is_forgotten() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("forget");

        let member = OrderedHandle::new(ResourceType::Event, order);
        composite.add_named("evt", member.clone()).unwrap();
        assert_eq!(composite.len(), 1);

        member.close().unwrap();
        assert_eq!(composite.len(), 0);
        assert!(composite.get("evt").is_none());

        composite.close().unwrap();
    }

    #[test]
    fn test_close_aggregates_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("agg");
        composite
            .add(OrderedHandle::failing(order.clone()))
            .unwrap();
        composite
            .add(OrderedHandle::failing(order.clone()))
            .unwrap();
        composite.add(OrderedHandle::new(ResourceType::Buffer, order)).unwrap();

        let err = composite.close().unwrap_err();
        match err {
            ResourceError::CloseFailed { causes } => assert_eq!(causes.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }

        // Idempotent: a second close reports nothing.
        composite.close().unwrap();
    }

    #[test]
    fn test_terminal_states_reject_additions() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("terminal");
        composite.close().unwrap();

        let err = composite
            .add(OrderedHandle::new(ResourceType::Buffer, order))
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidState { .. }));
    }

    #[test]
    fn test_double_close_is_noop() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeResource::new("twice");
        composite
            .add(OrderedHandle::new(ResourceType::Buffer, order.clone()))
            .unwrap();
        composite.close().unwrap();
        composite.close().unwrap();
        assert_eq!(order.lock().len(), 1);
    }
}
