use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::ItemFn;

/// Given a handler definition, generate its dispatcher entry: `<name>_raw`
/// takes the five-register `SyscallArgs` stream and pulls every declared
/// argument out of it through `SyscallFFI::make`, in declaration order.
/// A type decides for itself how many registers it consumes (integers and
/// pointers take one, slices and strings a pointer and a length), so the
/// dispatch table never spells out argument shapes again.
pub fn syscall_handler(func: ItemFn) -> TokenStream {
    let inputs = func.sig.inputs.clone();

    let func_name = func.sig.ident.to_string();

    let generated_name = format!("{}_raw", func_name);
    let generated_name = syn::Ident::new(&generated_name, Span::mixed_site());
    let func_name = syn::Ident::new(&func_name, Span::mixed_site());

    let mut conversions = Vec::new();
    let mut input_idents = Vec::new();

    for input in inputs {
        match input {
            syn::FnArg::Typed(pat_type) => {
                let ty = &pat_type.ty;
                let syn::Pat::Ident(ref ident) = &*pat_type.pat else {
                    panic!("Unsupported pattern type for input argument");
                };

                let ident = syn::Ident::new(&ident.ident.to_string(), Span::call_site());
                conversions.push(quote! {
                    let #ident: #ty = SyscallFFI::make(&mut args)?;
                });
                input_idents.push(ident);
            }
            syn::FnArg::Receiver(_) => panic!("Cannot use receiver arguments in syscall handlers"),
        }
    }

    quote! {
        #func

        pub fn #generated_name(mut args: SyscallArgs) -> Result<(), ErrorStatus> {
            #(#conversions)*
            #func_name(#(#input_idents),*).map_err(|err| err.into())
        }
    }
    .into()
}
