use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, Meta, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TestOptions {
    timeout_secs: u64,
    start_paused: bool,
}

fn parse_options(args: Punctuated<Meta, Token![,]>) -> syn::Result<TestOptions> {
    let mut options = TestOptions {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        start_paused: false,
    };
    for meta in args {
        match &meta {
            Meta::Path(path) if path.is_ident("start_paused") => options.start_paused = true,
            Meta::NameValue(pair) if pair.path.is_ident("timeout") => {
                let Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) = &pair.value
                else {
                    return Err(syn::Error::new_spanned(
                        &pair.value,
                        "timeout expects an integer number of seconds",
                    ));
                };
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected `timeout = <secs>` or `start_paused`",
                ))
            }
        }
    }
    Ok(options)
}

/// Runs an async test on a dedicated current-thread tokio runtime and fails it
/// once `timeout` seconds elapse.
///
/// `start_paused` builds the runtime with a paused clock, so timers advance
/// instantly whenever every task is idle. The timeout is enforced twice: on
/// the tokio clock inside the runtime and on the wall clock from the calling
/// thread.
#[proc_macro_attribute]
pub fn session_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Meta, Token![,]>::parse_terminated);
    let options = match parse_options(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "session_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let thread_name = sig.ident.to_string();
    let runtime = runtime_tokens(&options);

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#timeout);
            let (done, finished) = std::sync::mpsc::channel::<()>();
            let worker = std::thread::Builder::new()
                .name(#thread_name.to_owned())
                .spawn(move || {
                    let runtime = #runtime;
                    runtime.block_on(async {
                        if tokio::time::timeout(limit, async move #block).await.is_err() {
                            panic!("test exceeded {}s on the runtime clock", #timeout);
                        }
                    });
                    let _ = done.send(());
                })
                .expect("failed to spawn test thread");

            // A panicking body drops `done`, which ends the wait early.
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
                finished.recv_timeout(limit + std::time::Duration::from_secs(5))
            {
                panic!("test exceeded {}s on the wall clock", #timeout);
            }
            if let Err(payload) = worker.join() {
                std::panic::resume_unwind(payload);
            }
        }
    })
}

/// Expression building the current-thread runtime a test body runs on.
fn runtime_tokens(options: &TestOptions) -> proc_macro2::TokenStream {
    let paused = options
        .start_paused
        .then(|| quote! { .start_paused(true) });
    quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #paused
            .build()
            .expect("failed to build test runtime")
    }
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
