//! The isolated execution domain.
//!
//! A [`Sandbox`] owns a codec module instance, its linear memory and its
//! callback table. Control enters the module only through
//! [`Sandbox::invoke`], which catches panics, frees per-call scratch memory
//! and poisons the domain if the module faulted.
//!
//! The process-wide domain used by [`decode`](crate::decode) and
//! [`encode`](crate::encode) is managed with [`create_domain`],
//! [`destroy_domain`] and [`with_domain`]; its mutex serializes sessions.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use parking_lot::Mutex;

use crate::abi::Call;
use crate::boundary::{BoundaryValue, GuestPtr, Wire};
use crate::callback::{CallbackCx, CallbackKind, CallbackRegistration, CallbackTable, HostCallbacks, HostFault};
use crate::codec::{self, CodecModule, GuestAbort};
use crate::error::{DomainError, Trap};
use crate::memory::{AllocStats, DEFAULT_MEMORY_LIMIT, LinearMemory};

/// One isolated codec instance.
pub struct Sandbox {
    module: RefCell<Box<dyn CodecModule + Send>>,
    module_name: &'static str,
    memory: RefCell<LinearMemory>,
    callbacks: RefCell<CallbackTable>,
    session_active: Cell<bool>,
    poisoned: Cell<bool>,
}

impl Sandbox {
    /// Load the codec module at `module_path` with the default memory cap.
    pub fn create(module_path: impl AsRef<Path>) -> Result<Self, DomainError> {
        Self::with_memory_limit(module_path, DEFAULT_MEMORY_LIMIT)
    }

    /// Load the codec module at `module_path`, capping linear memory at
    /// `memory_limit` bytes.
    pub fn with_memory_limit(module_path: impl AsRef<Path>, memory_limit: u32) -> Result<Self, DomainError> {
        let module = codec::load(module_path.as_ref())?;
        log::debug!(
            "loaded codec module {} from {}",
            module.name(),
            module_path.as_ref().display()
        );
        Ok(Self::from_module(module, memory_limit))
    }

    pub(crate) fn from_module(module: Box<dyn CodecModule + Send>, memory_limit: u32) -> Self {
        Self {
            module_name: module.name(),
            module: RefCell::new(module),
            memory: RefCell::new(LinearMemory::new(memory_limit)),
            callbacks: RefCell::new(CallbackTable::default()),
            session_active: Cell::new(false),
            poisoned: Cell::new(false),
        }
    }

    /// Name of the loaded codec module.
    pub fn module_name(&self) -> &'static str {
        self.module_name
    }

    /// Allocation counters of the domain's linear memory.
    pub fn stats(&self) -> AllocStats {
        self.memory.borrow().stats()
    }

    /// Number of callbacks currently registered.
    pub fn active_callbacks(&self) -> usize {
        self.callbacks.borrow().active()
    }

    /// Whether a codec session is open on this domain.
    pub fn session_active(&self) -> bool {
        self.session_active.get()
    }

    /// Whether an earlier fault made the domain unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    /// Mark a session open. Returns `false` if one already is.
    pub(crate) fn claim_session(&self) -> bool {
        !self.session_active.replace(true)
    }

    pub(crate) fn end_session(&self) {
        self.session_active.set(false);
    }

    /// Allocate `count` zeroed elements in domain memory.
    pub(crate) fn malloc<T: Wire>(&self, count: u32) -> Result<SandboxAllocation<'_, T>, Trap> {
        let bytes = count.checked_mul(T::SIZE as u32).ok_or(Trap::OutOfMemory {
            requested: u32::MAX,
        })?;
        let mut memory = self.memory.try_borrow_mut().map_err(|_| Trap::Reentered)?;
        let ptr = memory.alloc(bytes)?;
        Ok(SandboxAllocation {
            sandbox: self,
            ptr,
            count,
            _elem: PhantomData,
        })
    }

    /// Allocate domain memory and copy `values` into it.
    pub(crate) fn copy_in<T: Wire>(&self, values: &[T]) -> Result<SandboxAllocation<'_, T>, Trap> {
        let count = u32::try_from(values.len()).map_err(|_| Trap::OutOfMemory {
            requested: u32::MAX,
        })?;
        let alloc = self.malloc::<T>(count)?;
        let stored = self.memory.borrow_mut().store_array(alloc.ptr, values);
        stored.map(|()| alloc)
    }

    /// Copy a string into domain memory with a terminating NUL.
    pub(crate) fn copy_in_str(&self, text: &str) -> Result<SandboxAllocation<'_, u8>, Trap> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.copy_in(&bytes)
    }

    pub(crate) fn register_callback(&self, kind: CallbackKind) -> Result<CallbackRegistration<'_>, Trap> {
        let slot = self
            .callbacks
            .try_borrow_mut()
            .map_err(|_| Trap::Reentered)?
            .register(kind);
        log::trace!("registered {kind:?} callback in slot {slot}");
        Ok(CallbackRegistration::new(self, slot))
    }

    pub(crate) fn unregister_callback(&self, slot: u32) {
        match self.callbacks.try_borrow_mut() {
            Ok(mut table) => {
                if !table.unregister(slot) {
                    log::error!("callback slot {slot} was not registered");
                }
            }
            Err(_) => log::error!("callback slot {slot} unregistered during a call"),
        }
    }

    /// Read an untrusted value out of domain memory.
    pub(crate) fn load<T: Wire>(&self, ptr: GuestPtr) -> Result<BoundaryValue<T>, Trap> {
        Ok(BoundaryValue::untrusted(self.memory.borrow().load(ptr)?))
    }

    /// Copy `count` untrusted elements out of domain memory.
    pub(crate) fn load_array<T: Wire>(&self, ptr: GuestPtr, count: u32) -> Result<BoundaryValue<Vec<T>>, Trap> {
        Ok(BoundaryValue::untrusted(
            self.memory.borrow().load_array(ptr, count)?,
        ))
    }

    /// Copy a NUL-terminated untrusted string out of domain memory.
    pub(crate) fn c_string(&self, ptr: GuestPtr, max: u32) -> Result<BoundaryValue<Option<Vec<u8>>>, Trap> {
        let memory = self.memory.borrow();
        Ok(BoundaryValue::untrusted(
            memory.c_string(ptr, max)?.map(<[u8]>::to_vec),
        ))
    }

    /// Transfer control to the codec.
    ///
    /// Callbacks the codec makes during the call are dispatched to `host`.
    /// Messages the host placed in domain memory during the call are released
    /// before returning.
    pub(crate) fn invoke(&self, call: Call, host: &mut dyn HostCallbacks) -> Result<BoundaryValue<u32>, Trap> {
        if self.poisoned.get() {
            return Err(Trap::Poisoned);
        }
        let mut module = self.module.try_borrow_mut().map_err(|_| Trap::Reentered)?;
        let mut memory = self.memory.try_borrow_mut().map_err(|_| Trap::Reentered)?;
        let callbacks = self.callbacks.try_borrow().map_err(|_| Trap::Reentered)?;

        log::trace!("invoke {}", call.name());
        let mut scratch = Vec::new();
        let outcome = {
            let mut env = GuestEnv {
                memory: &mut memory,
                callbacks: &callbacks,
                host,
                scratch: &mut scratch,
            };
            panic::catch_unwind(AssertUnwindSafe(|| module.call(&mut env, &call)))
        };

        for ptr in scratch {
            if let Err(trap) = memory.free(ptr) {
                log::warn!("releasing callback message: {trap}");
            }
        }

        match outcome {
            Ok(Ok(raw)) => Ok(BoundaryValue::untrusted(raw)),
            Ok(Err(GuestAbort::Error)) => Err(Trap::Aborted),
            Ok(Err(GuestAbort::Trap(trap))) => {
                log::warn!("{} trapped in {}: {trap}", self.module_name, call.name());
                self.poisoned.set(true);
                Err(trap)
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_owned());
                log::warn!("{} crashed in {}: {reason}", self.module_name, call.name());
                self.poisoned.set(true);
                Err(Trap::Crashed(reason))
            }
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("module", &self.module_name)
            .field("session_active", &self.session_active.get())
            .field("poisoned", &self.poisoned.get())
            .finish_non_exhaustive()
    }
}

/// Domain memory owned by the host side.
///
/// Released exactly once: on [`release`](Self::release) or on drop.
pub(crate) struct SandboxAllocation<'s, T: Wire> {
    sandbox: &'s Sandbox,
    ptr: GuestPtr,
    count: u32,
    _elem: PhantomData<T>,
}

impl<T: Wire> SandboxAllocation<'_, T> {
    pub(crate) fn ptr(&self) -> GuestPtr {
        self.ptr
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// Address of element `index`.
    pub(crate) fn element(&self, index: u32) -> GuestPtr {
        debug_assert!(index < self.count);
        GuestPtr::new(self.ptr.addr() + index * T::SIZE as u32)
    }

    pub(crate) fn get(&self, index: u32) -> Result<BoundaryValue<T>, Trap> {
        if index >= self.count {
            return Err(Trap::MemoryFault {
                addr: self.ptr.addr(),
                len: (index + 1).saturating_mul(T::SIZE as u32),
            });
        }
        self.sandbox.load(self.element(index))
    }

    pub(crate) fn read_all(&self) -> Result<BoundaryValue<Vec<T>>, Trap> {
        self.sandbox.load_array(self.ptr, self.count)
    }

    pub(crate) fn release(self) {}
}

impl<T: Wire> Drop for SandboxAllocation<'_, T> {
    fn drop(&mut self) {
        match self.sandbox.memory.try_borrow_mut() {
            Ok(mut memory) => {
                if let Err(trap) = memory.free(self.ptr) {
                    log::error!("releasing {:?}: {trap}", self.ptr);
                }
            }
            Err(_) => log::error!("{:?} released while the codec was running", self.ptr),
        }
    }
}

/// What a codec module can reach while it runs: its linear memory and the
/// registered callbacks.
pub(crate) struct GuestEnv<'a> {
    memory: &'a mut LinearMemory,
    callbacks: &'a CallbackTable,
    host: &'a mut dyn HostCallbacks,
    scratch: &'a mut Vec<GuestPtr>,
}

impl GuestEnv<'_> {
    pub(crate) fn memory(&self) -> &LinearMemory {
        &*self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut *self.memory
    }

    /// Codec warning; the codec carries on.
    pub(crate) fn warn(&self, message: &str) {
        log::warn!(target: "pngbox::codec", "{message}");
    }

    fn check_slot(&self, slot: u32, kind: CallbackKind) -> Result<(), Trap> {
        match self.callbacks.kind(slot) {
            Some(k) if k == kind => Ok(()),
            _ => Err(Trap::BadCallback(slot)),
        }
    }

    pub(crate) fn call_read(&mut self, slot: u32, buf: GuestPtr, len: u32) -> Result<Result<(), HostFault>, Trap> {
        self.check_slot(slot, CallbackKind::Read)?;
        let mut cx = CallbackCx::new(self.memory, self.scratch);
        Ok(self.host.on_read(&mut cx, buf, len))
    }

    pub(crate) fn call_write(&mut self, slot: u32, buf: GuestPtr, len: u32) -> Result<Result<(), HostFault>, Trap> {
        self.check_slot(slot, CallbackKind::Write)?;
        let mut cx = CallbackCx::new(self.memory, self.scratch);
        Ok(self.host.on_write(&mut cx, buf, len))
    }

    pub(crate) fn call_unknown_chunk(&mut self, slot: u32, record: GuestPtr) -> Result<i32, Trap> {
        self.check_slot(slot, CallbackKind::UnknownChunk)?;
        let mut cx = CallbackCx::new(self.memory, self.scratch);
        Ok(self.host.on_unknown_chunk(&mut cx, record))
    }

    pub(crate) fn call_error(&mut self, slot: u32, message: GuestPtr) -> Result<(), Trap> {
        self.check_slot(slot, CallbackKind::Error)?;
        let mut cx = CallbackCx::new(self.memory, self.scratch);
        self.host.on_error(&mut cx, message);
        Ok(())
    }
}

static DOMAIN: Mutex<Option<Sandbox>> = parking_lot::const_mutex(None);

thread_local! {
    /// Set while this thread is inside [`with_domain`].
    static HOLDING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as holding the domain until dropped. Taking
/// the domain lock again from inside a callback would never return, so
/// re-entry is refused instead.
struct Held(());

impl Held {
    fn enter() -> Result<Self, DomainError> {
        if HOLDING.replace(true) {
            return Err(DomainError::Busy);
        }
        Ok(Self(()))
    }

    fn check() -> Result<(), DomainError> {
        if HOLDING.get() { Err(DomainError::Busy) } else { Ok(()) }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HOLDING.set(false);
    }
}

/// Create the process-wide domain from the codec module at `module_path`.
pub fn create_domain(module_path: impl AsRef<Path>) -> Result<(), DomainError> {
    Held::check()?;
    let mut slot = DOMAIN.lock();
    if slot.is_some() {
        return Err(DomainError::AlreadyCreated);
    }
    *slot = Some(Sandbox::create(module_path)?);
    Ok(())
}

/// Tear down the process-wide domain.
pub fn destroy_domain() -> Result<(), DomainError> {
    Held::check()?;
    let sandbox = DOMAIN.lock().take().ok_or(DomainError::NotCreated)?;
    let stats = sandbox.stats();
    if stats.live() != 0 {
        log::warn!("domain destroyed with {} live allocations", stats.live());
    }
    log::debug!("destroyed domain {}", sandbox.module_name());
    Ok(())
}

/// Whether the process-wide domain exists.
pub fn domain_exists() -> bool {
    // Inside `with_domain` the lock is already ours and the domain exists.
    HOLDING.get() || DOMAIN.lock().is_some()
}

/// Run `f` with exclusive access to the process-wide domain.
///
/// Other threads wait for the domain. A call from inside `f` on the same
/// thread (a progress callback, a reader or writer) fails with
/// [`DomainError::Busy`].
pub fn with_domain<R>(f: impl FnOnce(&Sandbox) -> R) -> Result<R, DomainError> {
    let _held = Held::enter()?;
    let slot = DOMAIN.lock();
    let sandbox = slot.as_ref().ok_or(DomainError::NotCreated)?;
    Ok(f(sandbox))
}
