use proc_macro::TokenStream;
use syn::{ItemFn, parse_macro_input};

mod syscalls;

#[proc_macro_attribute]
/// Given a handler definition, generate the dispatcher-facing entry for it.
///
/// The generated function has the handler's name with `_raw` appended. It
/// takes the raw five-register argument stream (`SyscallArgs`), converts
/// each declared argument through the `SyscallFFI` trait — which decides
/// per type how many registers to consume — and calls the handler.
///
/// The handler must return `Result<(), E>` where `E: Into<ErrorStatus>`;
/// every argument type must implement `SyscallFFI`, and `SyscallArgs`,
/// `SyscallFFI` and `ErrorStatus` must be in scope.
///
/// for example given this handler:
/// ```ignore
/// #[syscall_handler]
/// fn example_syscall(name: &str, out: &mut u64) -> Result<(), ErrorStatus> {}
/// ```
///
/// it will generate:
/// ```ignore
/// pub fn example_syscall_raw(mut args: SyscallArgs) -> Result<(), ErrorStatus> {
///     let name: &str = SyscallFFI::make(&mut args)?; // consumes ptr + len
///     let out: &mut u64 = SyscallFFI::make(&mut args)?; // consumes ptr
///     example_syscall(name, out).map_err(|err| err.into())
/// }
/// ```
pub fn syscall_handler(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let func = parse_macro_input!(item as ItemFn);
    syscalls::syscall_handler(func)
}
