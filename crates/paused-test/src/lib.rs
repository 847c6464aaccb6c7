use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Virtual time a paused test may consume before it is considered stuck.
const VIRTUAL_BUDGET_SECS: u64 = 86_400;

/// Runs an async test on a current-thread Tokio runtime whose clock starts
/// paused, so timers fire as soon as every task is idle.
///
/// The optional argument is the wall-clock limit in seconds (default 30). A
/// test that parks forever without pending timers trips that limit; one that
/// keeps timers alive forever trips the virtual budget instead.
#[proc_macro_attribute]
pub fn tokio_paused_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut wall_secs: u64 = 30;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        wall_secs = lit
            .base10_parse()
            .unwrap_or_else(|err| panic!("invalid wall-clock limit: {err}"));
        if wall_secs == 0 {
            panic!("wall-clock limit must be greater than zero");
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_paused_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let virtual_budget = VIRTUAL_BUDGET_SECS;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let wall_clock_limit = std::time::Duration::from_secs(#wall_secs);
            let virtual_budget = std::time::Duration::from_secs(#virtual_budget);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(true)
                        .build()
                        .expect("failed to build paused Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(virtual_budget, async move #block)
                            .await
                            .expect("test exceeded its virtual time budget");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(wall_clock_limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test stalled past its wall-clock limit")
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

// Strips `#[test]` and `#[tokio::test]` so the expansion does not register twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    match segments.as_slice() {
        [only] => only.ident == "test",
        [first, second] => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}
