//! Test guests.
//!
//! `GuestBuilder` emits a small permission module in WAT. It builds the key
//! `perm:{subject}:{resource}:{permission}`, asks the host for its value,
//! and grants the permission when the value is the text `true`. Knobs
//! switch its allocator, release shape, and key framing so each bridge
//! path can be driven from tests.

use crate::instance::GuestInstance;
use permbridge_core::KeyFraming;

/// Builder for a test permission guest
#[derive(Debug, Clone, Default)]
pub struct GuestBuilder {
    sized_free: bool,
    exhausted_allocator: bool,
    key_framing: KeyFraming,
    result_override: Option<i32>,
    lookup_pointer_override: Option<u32>,
    trapping: bool,
    spinning: bool,
}

impl GuestBuilder {
    /// Well-behaved guest with `free(ptr)` and NUL-terminated keys
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `free(ptr, len)` instead of `free(ptr)`
    #[must_use]
    pub fn sized_free(mut self) -> Self {
        self.sized_free = true;
        self
    }

    /// Allocator that always returns the null offset
    #[must_use]
    pub fn exhausted_allocator(mut self) -> Self {
        self.exhausted_allocator = true;
        self
    }

    /// How the guest passes lookup keys
    #[must_use]
    pub fn key_framing(mut self, framing: KeyFraming) -> Self {
        self.key_framing = framing;
        self
    }

    /// Return `value` from the permission export regardless of the lookup
    #[must_use]
    pub fn result_override(mut self, value: i32) -> Self {
        self.result_override = Some(value);
        self
    }

    /// Pass `ptr` to the lookup import instead of the real key
    #[must_use]
    pub fn lookup_pointer_override(mut self, ptr: u32) -> Self {
        self.lookup_pointer_override = Some(ptr);
        self
    }

    /// Trap on entry to the permission export
    #[must_use]
    pub fn trapping(mut self) -> Self {
        self.trapping = true;
        self
    }

    /// Loop forever on entry to the permission export
    #[must_use]
    pub fn spinning(mut self) -> Self {
        self.spinning = true;
        self
    }

    /// Render the module as WAT
    #[must_use]
    pub fn wat(&self) -> String {
        let alloc_body = if self.exhausted_allocator {
            "(i32.const 0)"
        } else {
            BUMP_ALLOC
        };

        let free = if self.sized_free {
            r#"(func (export "free") (param $ptr i32) (param $len i32)
    (call $free_impl (local.get $ptr) (local.get $len)))"#
        } else {
            r#"(func (export "free") (param $ptr i32)
    (call $free_impl (local.get $ptr) (i32.const 0)))"#
        };

        let entry = match (self.trapping, self.spinning) {
            (true, _) => "unreachable",
            (false, true) => "(loop $spin (br $spin))",
            (false, false) => "",
        };

        let key_arg = match (self.lookup_pointer_override, self.key_framing) {
            (Some(ptr), _) => format!("(i32.const {})", ptr as i32),
            (None, KeyFraming::NullTerminated) => "(local.get $key)".to_string(),
            (None, KeyFraming::LengthPrefixed) => LENGTH_PREFIXED_KEY.to_string(),
        };

        let result = match self.result_override {
            Some(value) => format!("(i32.const {value})"),
            None => "(local.get $result)".to_string(),
        };

        format!(
            r#"(module
  (import "app" "getData" (func $getData (param i32) (result i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (global $frees (mut i32) (i32.const 0))
  (global $freed (mut i32) (i32.const 0))
  (data (i32.const 16) "perm:")
  (data (i32.const 32) "true\00")

  (func $alloc (export "malloc") (param $size i32) (result i32)
    (local $ptr i32) (local $end i32) (local $have i32)
    {alloc_body})

  (func $free_impl (param $ptr i32) (param $len i32)
    (global.set $frees (i32.add (global.get $frees) (i32.const 1)))
    (global.set $freed (i32.add (global.get $freed) (local.get $len))))

  {free}

  (func (export "frees") (result i32) (global.get $frees))
  (func (export "freed_bytes") (result i32) (global.get $freed))

  (func $strlen (param $p i32) (result i32)
    (local $n i32)
    (block $done
      (loop $scan
        (br_if $done (i32.eqz (i32.load8_u (i32.add (local.get $p) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $scan)))
    (local.get $n))

  (func $streq (param $a i32) (param $b i32) (result i32)
    (local $c i32)
    (loop $cmp
      (local.set $c (i32.load8_u (local.get $a)))
      (if (i32.ne (local.get $c) (i32.load8_u (local.get $b)))
        (then (return (i32.const 0))))
      (if (i32.eqz (local.get $c))
        (then (return (i32.const 1))))
      (local.set $a (i32.add (local.get $a) (i32.const 1)))
      (local.set $b (i32.add (local.get $b) (i32.const 1)))
      (br $cmp))
    (i32.const 0))

  (func $utoa (param $v i32) (param $dst i32) (result i32)
    (local $len i32) (local $t i32)
    (local.set $t (local.get $v))
    (local.set $len (i32.const 1))
    (block $counted
      (loop $count
        (br_if $counted (i32.lt_u (local.get $t) (i32.const 10)))
        (local.set $t (i32.div_u (local.get $t) (i32.const 10)))
        (local.set $len (i32.add (local.get $len) (i32.const 1)))
        (br $count)))
    (local.set $t (local.get $len))
    (loop $write
      (local.set $t (i32.sub (local.get $t) (i32.const 1)))
      (i32.store8
        (i32.add (local.get $dst) (local.get $t))
        (i32.add (i32.const 48) (i32.rem_u (local.get $v) (i32.const 10))))
      (local.set $v (i32.div_u (local.get $v) (i32.const 10)))
      (br_if $write (i32.gt_u (local.get $t) (i32.const 0))))
    (local.get $len))

  (func (export "hasPerm") (param $subject i32) (param $resource i32) (param $perm i32) (result i32)
    (local $plen i32) (local $key i32) (local $at i32) (local $pair i32)
    (local $value i32) (local $result i32)
    {entry}
    (local.set $plen (call $strlen (local.get $perm)))
    (local.set $key (call $alloc (i32.add (local.get $plen) (i32.const 28))))
    (if (i32.eqz (local.get $key)) (then unreachable))
    (memory.copy (local.get $key) (i32.const 16) (i32.const 5))
    (local.set $at (i32.add (local.get $key) (i32.const 5)))
    (local.set $at (i32.add (local.get $at) (call $utoa (local.get $subject) (local.get $at))))
    (i32.store8 (local.get $at) (i32.const 58))
    (local.set $at (i32.add (local.get $at) (i32.const 1)))
    (local.set $at (i32.add (local.get $at) (call $utoa (local.get $resource) (local.get $at))))
    (i32.store8 (local.get $at) (i32.const 58))
    (local.set $at (i32.add (local.get $at) (i32.const 1)))
    (memory.copy (local.get $at) (local.get $perm) (local.get $plen))
    (local.set $at (i32.add (local.get $at) (local.get $plen)))
    (i32.store8 (local.get $at) (i32.const 0))
    (local.set $value (call $getData {key_arg}))
    (local.set $result (call $streq (local.get $value) (i32.const 32)))
    (call $free_impl (local.get $key) (i32.const 0))
    (call $free_impl (local.get $value) (i32.const 0))
    {result}))
"#
        )
    }

    /// Assemble the module
    ///
    /// # Panics
    ///
    /// Panics if the generated WAT does not assemble, which is a bug in
    /// this builder
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).expect("generated guest must assemble")
    }
}

/// Bump allocator that grows memory on demand and returns 0 when it cannot
const BUMP_ALLOC: &str = r#"(local.set $ptr
      (i32.and (i32.add (global.get $heap) (i32.const 7)) (i32.const -8)))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.lt_u (local.get $end) (local.get $ptr))
      (then (return (i32.const 0))))
    (local.set $have (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $have))
      (then
        (if (i32.eq
              (memory.grow
                (i32.shr_u
                  (i32.add (i32.sub (local.get $end) (local.get $have)) (i32.const 65535))
                  (i32.const 16)))
              (i32.const -1))
          (then (return (i32.const 0))))))
    (global.set $heap (local.get $end))
    (local.get $ptr)"#;

/// Stores `(key, len)` in a fresh pair and leaves its address on the stack
const LENGTH_PREFIXED_KEY: &str = r#"(block (result i32)
      (local.set $pair (call $alloc (i32.const 8)))
      (i32.store (local.get $pair) (local.get $key))
      (i32.store offset=4 (local.get $pair) (i32.sub (local.get $at) (local.get $key)))
      (local.get $pair))"#;

/// Reads the guest's own release counters
pub trait GuestCounters {
    /// Number of `free` calls the guest has seen
    fn guest_frees(&mut self) -> u32;
    /// Sum of lengths passed to a sized `free`
    fn guest_freed_bytes(&mut self) -> u32;
}

impl GuestCounters for GuestInstance {
    fn guest_frees(&mut self) -> u32 {
        read_counter(self, "frees")
    }

    fn guest_freed_bytes(&mut self) -> u32 {
        read_counter(self, "freed_bytes")
    }
}

fn read_counter(guest: &mut GuestInstance, name: &str) -> u32 {
    let instance = *guest.wasm_instance();
    if let Some(fuel) = guest.config().max_fuel {
        guest
            .store_mut()
            .set_fuel(fuel)
            .expect("fuel metering is enabled");
    }
    instance
        .get_typed_func::<(), u32>(guest.store_mut(), name)
        .and_then(|f| f.call(guest.store_mut(), ()))
        .expect("test guest exports its counters")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_assembles() {
        let variants = [
            GuestBuilder::new(),
            GuestBuilder::new().sized_free(),
            GuestBuilder::new().exhausted_allocator(),
            GuestBuilder::new().key_framing(KeyFraming::LengthPrefixed),
            GuestBuilder::new().result_override(7),
            GuestBuilder::new().lookup_pointer_override(u32::MAX - 3),
            GuestBuilder::new().trapping(),
            GuestBuilder::new().spinning(),
        ];
        for builder in variants {
            assert!(builder.build().starts_with(b"\0asm"));
        }
    }
}
