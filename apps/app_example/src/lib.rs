//! Guest used by the isowork tests (see `tests/fixtures/example.wat`).
//!
//! Build with `cargo build --target wasm32-unknown-unknown --release`.

use std::alloc::Layout;

#[link(wasm_import_module = "env")]
extern "C" {
    /// Hands a string to the host: address in the high 32 bits, length in the low.
    fn sig(fat_ptr: i64);
}

fn signal(message: &str) {
    let fat_ptr = ((message.as_ptr() as u32 as i64) << 32) | message.len() as u32 as i64;
    unsafe { sig(fat_ptr) }
}

/// Scratch area for `to_lower_case`, NUL terminated.
#[no_mangle]
pub static mut BUFFER: [u8; 1024] = [0; 1024];

#[no_mangle]
pub extern "C" fn init() {
    std::panic::set_hook(Box::new(|info| signal(&info.to_string())));
}

#[no_mangle]
pub extern "C" fn malloc(cap: usize) -> *mut u8 {
    match Layout::from_size_align(cap.max(1), 8) {
        Ok(layout) => unsafe { std::alloc::alloc(layout) },
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn free(ptr: *mut u8, cap: usize) {
    if let Ok(layout) = Layout::from_size_align(cap.max(1), 8) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

#[no_mangle]
pub extern "C" fn byte(ptr: *const u8) -> u32 {
    unsafe { *ptr as u32 }
}

#[no_mangle]
pub extern "C" fn set_byte(ptr: *mut u8, value: u32) {
    unsafe { *ptr = value as u8 }
}

#[no_mangle]
pub extern "C" fn fibonacci(n: u32) -> u32 {
    if n < 2 {
        1
    } else {
        fibonacci(n - 1) + fibonacci(n - 2)
    }
}

#[no_mangle]
pub extern "C" fn add(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}

#[no_mangle]
pub extern "C" fn endless_loop() {
    #[allow(clippy::empty_loop)]
    loop {}
}

#[no_mangle]
pub extern "C" fn crash() {
    panic!("crash requested");
}

#[no_mangle]
pub extern "C" fn to_lower_case() {
    let buffer = unsafe { &mut *std::ptr::addr_of_mut!(BUFFER) };
    for byte in buffer.iter_mut().take_while(|b| **b != 0) {
        byte.make_ascii_lowercase();
    }
}
