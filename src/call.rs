//! Calling the original function through a hook's trampoline.
//!
//! Rust has no equivalent of a variadic `Call<Ret, Args...>(args...)`
//! template method. The idiomatic substitute is to cast the trampoline
//! address to the target's own function-pointer type and call it directly.

use crate::hook::Hook;

/// Reinterpret a hook's trampoline address as a callable function pointer.
///
/// # Safety
/// `F` must be the exact `extern "C"` (or otherwise ABI-matching) function
/// pointer type of the function `hook` was built against.
pub unsafe fn trampoline_fn<F: Copy>(hook: &Hook) -> F {
    let ptr = hook.trampoline_ptr();
    std::mem::transmute_copy(&ptr)
}

/// Call a hook's trampoline with the target's original signature.
///
/// ```ignore
/// let result = call_hook!(hook, extern "C" fn(i32, i32) -> i32, a, b);
/// ```
#[macro_export]
macro_rules! call_hook {
    ($hook:expr, $sig:ty, $($arg:expr),* $(,)?) => {{
        // SAFETY: caller asserts $sig matches the hooked function's ABI.
        let f: $sig = unsafe { $crate::call::trampoline_fn($hook) };
        f($($arg),*)
    }};
}

#[cfg(test)]
mod tests {
    use crate::hook::Hook;

    #[test]
    fn call_hook_reaches_the_trampoline() {
        extern "C" fn add(a: i32, b: i32) -> i32 {
            a + b
        }
        extern "C" fn add_detour(a: i32, b: i32) -> i32 {
            a + b + 100
        }

        let hook = Hook::new(add as usize, add_detour as usize, 64).expect("build");
        hook.enable().expect("enable");

        let via_trampoline = call_hook!(&hook, extern "C" fn(i32, i32) -> i32, 2, 3);
        assert_eq!(via_trampoline, 5);

        hook.disable().expect("disable");
    }
}
