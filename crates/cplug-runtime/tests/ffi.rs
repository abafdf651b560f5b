// Integration tests against the system C and math libraries.
// Library names are platform specific; Windows has neither as a standalone DLL.

use cplug_runtime::ffi::{CallError, LoadError};
use cplug_runtime::{
    create_callback, describe, invoke, Abi, BoundValue, Cif, Error, ExternFunction, ExternType,
    HostType, LibraryLoader, OpenFlags, Plugin, RawAddress, Signature, Value,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(target_os = "macos")]
const LIBM: &str = "libm.dylib";
#[cfg(not(target_os = "macos"))]
const LIBM: &str = "libm.so.6";

#[cfg(target_os = "macos")]
const LIBC: &str = "libc.dylib";
#[cfg(not(target_os = "macos"))]
const LIBC: &str = "libc.so.6";

fn func(params: Vec<HostType>, result: Option<HostType>) -> HostType {
    HostType::function(params, result)
}

fn bind_fn(plugin: &Plugin, name: &str, ty: HostType) -> ExternFunction {
    unsafe { plugin.lookup_c(name, &ty) }
        .unwrap()
        .into_function()
        .unwrap()
}

// ===== Bound function calls =====

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_fabs_double() {
    let libm = Plugin::open(LIBM).unwrap();
    let fabs = bind_fn(&libm, "fabs", func(vec![HostType::F64], Some(HostType::F64)));

    assert_eq!(fabs.call(&[Value::F64(-42.0)]).unwrap(), Value::F64(42.0));
    assert_eq!(fabs.signature().to_string(), "(double) -> double");
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_fabsf_float() {
    let libm = Plugin::open(LIBM).unwrap();
    let fabsf = bind_fn(&libm, "fabsf", func(vec![HostType::F32], Some(HostType::F32)));

    assert_eq!(fabsf.call(&[Value::F32(-2.5)]).unwrap(), Value::F32(2.5));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_pow_two_arguments() {
    let libm = Plugin::open(LIBM).unwrap();
    let pow = bind_fn(
        &libm,
        "pow",
        func(vec![HostType::F64, HostType::F64], Some(HostType::F64)),
    );

    assert_eq!(
        pow.call(&[Value::F64(2.0), Value::F64(10.0)]).unwrap(),
        Value::F64(1024.0)
    );
}

#[rstest]
#[case(Value::I32(-7), Value::I32(7))]
#[case(Value::I64(-5), Value::I32(5))]
#[case(Value::I64(0x1_0000_0003), Value::I32(3))]
#[case(Value::I8(-1), Value::I32(1))]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_abs_int_conversions(#[case] arg: Value, #[case] expected: Value) {
    let libc = Plugin::open(LIBC).unwrap();
    let abs = bind_fn(
        &libc,
        "abs",
        func(
            vec![HostType::C(ExternType::Int)],
            Some(HostType::C(ExternType::Int)),
        ),
    );

    assert_eq!(abs.call(&[arg]).unwrap(), expected);
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_unsigned_argument_widened_into_long() {
    let libc = Plugin::open(LIBC).unwrap();
    let labs = bind_fn(
        &libc,
        "labs",
        func(
            vec![HostType::C(ExternType::Long)],
            Some(HostType::C(ExternType::Long)),
        ),
    );

    // u16 zero-extends, so the value stays positive
    let result = labs.call(&[Value::U16(0xffff)]).unwrap();
    assert_eq!(result.as_i64(), Some(0xffff));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_strlen_string_argument() {
    let libc = Plugin::open(LIBC).unwrap();
    let strlen = bind_fn(
        &libc,
        "strlen",
        func(vec![HostType::String], Some(HostType::USize)),
    );

    assert_eq!(
        strlen.call(&[Value::string("native")]).unwrap(),
        Value::USize(6)
    );
    assert!(matches!(
        strlen.call(&[Value::string("bad\0string")]),
        Err(CallError::Marshal(_))
    ));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_getenv_string_result() {
    let expected = match std::env::var("PATH") {
        Ok(path) => path,
        Err(_) => return,
    };
    let libc = Plugin::open(LIBC).unwrap();
    let getenv = bind_fn(
        &libc,
        "getenv",
        func(vec![HostType::String], Some(HostType::String)),
    );

    assert_eq!(
        getenv.call(&[Value::string("PATH")]).unwrap(),
        Value::String(expected)
    );
    // NULL char* results are reported, not dereferenced
    assert!(matches!(
        getenv.call(&[Value::string("CPLUG_FFI_TEST_UNSET_VARIABLE")]),
        Err(CallError::Marshal(_))
    ));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_arity_mismatch_before_call() {
    let libm = Plugin::open(LIBM).unwrap();
    let fabs = bind_fn(&libm, "fabs", func(vec![HostType::F64], Some(HostType::F64)));

    assert_eq!(
        fabs.call(&[]),
        Err(CallError::ArityMismatch {
            expected: 1,
            got: 0
        })
    );
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_concurrent_calls() {
    let libm = Plugin::open(LIBM).unwrap();
    let fabs = Arc::new(bind_fn(
        &libm,
        "fabs",
        func(vec![HostType::F64], Some(HostType::F64)),
    ));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let fabs = Arc::clone(&fabs);
            thread::spawn(move || {
                for j in 0..200 {
                    let x = -((i * 1000 + j) as f64);
                    assert_eq!(fabs.call(&[Value::F64(x)]).unwrap(), Value::F64(-x));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

// ===== Symbols and data =====

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_pointer_type_yields_symbol_address() {
    let libc = Plugin::open(LIBC).unwrap();
    let bound = unsafe { libc.lookup_c("puts", &HostType::Pointer) }.unwrap();

    let addr = bound.into_value().unwrap().as_pointer().unwrap();
    assert!(!addr.is_null());
    assert_eq!(addr, libc.symbol("puts").unwrap());
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn test_read_data_symbols() {
    let libc = Plugin::open(LIBC).unwrap();

    let name = unsafe { libc.lookup_c("program_invocation_short_name", &HostType::String) }
        .unwrap()
        .into_value()
        .unwrap();
    assert!(!name.as_str().unwrap().is_empty());

    let environ = unsafe { libc.lookup_c("environ", &HostType::C(ExternType::Pointer)) }
        .unwrap()
        .into_value()
        .unwrap();
    assert!(!environ.as_pointer().unwrap().is_null());
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_void_data_symbol_is_not_a_pointer() {
    let libc = Plugin::open(LIBC).unwrap();
    let result = unsafe { libc.lookup_c("puts", &HostType::Void) };
    assert!(matches!(result, Err(Error::NotAPointer { .. })));
}

#[rstest]
#[case(func(vec![HostType::Struct(vec![HostType::I32, HostType::I32])], None))]
#[case(func(vec![HostType::Bool], Some(HostType::I32)))]
#[case(HostType::Function(Signature {
    params: vec![HostType::String],
    results: vec![HostType::I32],
    variadic: true,
}))]
#[case(func(vec![HostType::Complex128], Some(HostType::F64)))]
#[case(HostType::Array(Box::new(HostType::U8), 16))]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_unsupported_types_rejected(#[case] ty: HostType) {
    let libc = Plugin::open(LIBC).unwrap();
    let result = unsafe { libc.lookup_c("printf", &ty) };
    assert!(matches!(result, Err(Error::UnsupportedType { .. })));
}

// ===== Loading errors =====

#[test]
fn test_missing_library() {
    let result = Plugin::open("libcplug_definitely_missing.so");
    assert!(matches!(result, Err(Error::Load(LoadError::LoadFailed { .. }))));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_missing_symbol() {
    let libm = Plugin::open(LIBM).unwrap();
    let result = unsafe {
        libm.lookup_c(
            "cplug_no_such_function",
            &func(vec![], Some(HostType::I32)),
        )
    };

    match result {
        Err(Error::Load(LoadError::SymbolNotFound { symbol, .. })) => {
            assert_eq!(symbol, "cplug_no_such_function")
        }
        other => panic!("expected SymbolNotFound, got {:?}", other.map(|b| b.is_function())),
    }
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_open_with_loader_flags() {
    let loader = LibraryLoader::new().with_flags(OpenFlags::LAZY | OpenFlags::LOCAL);
    let libm = Plugin::open_with(&loader, LIBM).unwrap();
    assert!(libm.library().is_open());
}

// ===== Handle liveness =====

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_call_after_close_fails() {
    let libm = Plugin::open(LIBM).unwrap();
    let fabs = bind_fn(&libm, "fabs", func(vec![HostType::F64], Some(HostType::F64)));
    assert!(fabs.call(&[Value::F64(-1.0)]).is_ok());

    libm.close().unwrap();

    assert!(!libm.library().is_open());
    assert!(matches!(
        fabs.call(&[Value::F64(-1.0)]),
        Err(CallError::HandleClosed(_))
    ));
    assert!(matches!(
        libm.symbol("fabs"),
        Err(Error::Load(LoadError::AlreadyClosed(_)))
    ));
    assert!(matches!(
        libm.close(),
        Err(Error::Load(LoadError::AlreadyClosed(_)))
    ));
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libm on this platform")]
fn test_clones_share_the_handle() {
    let libm = Plugin::open(LIBM).unwrap();
    let other = libm.clone();
    other.close().unwrap();
    assert!(!libm.library().is_open());
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_callback_reenters_library_while_close_pending() {
    let libc = Plugin::open(LIBC).unwrap();
    let qsort = bind_fn(
        &libc,
        "qsort",
        func(
            vec![
                HostType::Pointer,
                HostType::USize,
                HostType::USize,
                HostType::Pointer,
            ],
            None,
        ),
    );
    let abs = bind_fn(
        &libc,
        "abs",
        func(
            vec![HostType::C(ExternType::Int)],
            Some(HostType::C(ExternType::Int)),
        ),
    );

    let closer = libc.clone();
    let first = Arc::new(AtomicBool::new(true));
    let close_thread = Arc::new(Mutex::new(None));
    let nested = Arc::new(Mutex::new(None));
    let (first_seen, close_slot, nested_slot) = (
        Arc::clone(&first),
        Arc::clone(&close_thread),
        Arc::clone(&nested),
    );

    let compare = create_callback(
        move |args| {
            if first_seen.swap(false, Ordering::SeqCst) {
                let closer = closer.clone();
                *close_slot.lock().unwrap() = Some(thread::spawn(move || closer.close()));
                // let close() queue for the write lock
                thread::sleep(Duration::from_millis(300));
                *nested_slot.lock().unwrap() = Some(abs.call(&[Value::I32(-9)]));
            }
            let read = |v: &Value| unsafe { *(v.as_pointer().unwrap().as_ptr() as *const i32) };
            Ok(Value::I32(read(&args[0]).cmp(&read(&args[1])) as i32))
        },
        vec![ExternType::Pointer, ExternType::Pointer],
        ExternType::Int,
    )
    .unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut data = vec![3i32, 1, 2];
        let result = qsort.call(&[
            Value::Pointer(RawAddress::new(data.as_mut_ptr() as *mut c_void)),
            Value::USize(data.len()),
            Value::USize(std::mem::size_of::<i32>()),
            Value::Pointer(compare.code_ptr()),
        ]);
        let _ = done_tx.send((result, data));
    });

    let (result, data) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("re-entrant call blocked behind a pending close");
    assert_eq!(result, Ok(Value::Void));
    assert_eq!(data, vec![1, 2, 3]);
    assert_eq!(nested.lock().unwrap().take(), Some(Ok(Value::I32(9))));

    let handle = close_thread.lock().unwrap().take().unwrap();
    handle.join().unwrap().unwrap();
    assert!(!libc.library().is_open());
}

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_with_symbol_holds_library_open() {
    let libc = Plugin::open(LIBC).unwrap();
    let addr = libc.library().with_symbol("puts", |addr| addr).unwrap();
    assert_eq!(addr, libc.symbol("puts").unwrap());

    let is_open = libc
        .library()
        .with_symbol("puts", |_| libc.library().is_open())
        .unwrap();
    assert!(is_open);

    libc.close().unwrap();
    assert!(matches!(
        libc.library().with_symbol("puts", |addr| addr),
        Err(LoadError::AlreadyClosed(_))
    ));
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn test_data_reads_race_with_close() {
    let libc = Plugin::open(LIBC).unwrap();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let libc = libc.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    match unsafe { libc.lookup_c("environ", &HostType::C(ExternType::Pointer)) } {
                        Ok(bound) => assert!(!bound.is_function()),
                        Err(Error::Load(LoadError::AlreadyClosed(_))) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(1));
    libc.close().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

// ===== Call interfaces =====

#[test]
fn test_bad_abi_and_bad_typedef() {
    let int = describe(ExternType::Int);
    assert!(Cif::with_abi(Abi::from_raw(0), int, &[int]).is_err());
    assert!(Cif::new(int, &[describe(ExternType::Void)]).is_err());
}

// ===== Callbacks =====

#[test]
#[cfg_attr(target_os = "windows", ignore = "no standalone libc on this platform")]
fn test_qsort_with_callback_comparator() {
    let libc = Plugin::open(LIBC).unwrap();
    let qsort = bind_fn(
        &libc,
        "qsort",
        func(
            vec![
                HostType::Pointer,
                HostType::USize,
                HostType::USize,
                HostType::Pointer,
            ],
            None,
        ),
    );

    let compare = create_callback(
        |args| {
            let read = |v: &Value| unsafe { *(v.as_pointer().unwrap().as_ptr() as *const i32) };
            Ok(Value::I32(read(&args[0]).cmp(&read(&args[1])) as i32))
        },
        vec![ExternType::Pointer, ExternType::Pointer],
        ExternType::Int,
    )
    .unwrap();

    let mut data = vec![5i32, -1, 4, 2, 3, 0];
    let result = qsort.call(&[
        Value::Pointer(RawAddress::new(data.as_mut_ptr() as *mut c_void)),
        Value::USize(data.len()),
        Value::USize(std::mem::size_of::<i32>()),
        Value::Pointer(compare.code_ptr()),
    ]);

    assert_eq!(result, Ok(Value::Void));
    assert_eq!(data, vec![-1, 0, 2, 3, 4, 5]);
}

#[test]
fn test_callback_through_raw_invoke() {
    let square = create_callback(
        |args| Ok(Value::F64(args[0].as_f64().unwrap_or(0.0).powi(2))),
        vec![ExternType::F64],
        ExternType::F64,
    )
    .unwrap();

    let mut x = 3.0f64;
    let mut ret = 0.0f64;
    let mut args = [&mut x as *mut f64 as *mut c_void];
    unsafe {
        invoke(
            square.cif(),
            square.code_ptr(),
            &mut ret as *mut f64 as *mut c_void,
            &mut args,
        )
    }
    .unwrap();

    assert_eq!(ret, 9.0);
}

#[test]
fn test_bound_value_accessors() {
    let value = BoundValue::Value(Value::I32(1));
    assert!(!value.is_function());
    assert_eq!(value.into_value(), Some(Value::I32(1)));
}
