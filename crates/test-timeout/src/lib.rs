//! `#[tokio_timeout_test]`: runs an async test on its own Tokio runtime and
//! fails it once the deadline passes, even if the runtime itself is wedged.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn defaults() {}
//!
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn ten_seconds() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
//! async fn on_a_pool() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread { workers: Option<usize> },
}

struct Options {
    secs: u64,
    flavor: Flavor,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        }
    }
}

fn positive<T>(lit: &LitInt) -> syn::Result<T>
where
    T: std::str::FromStr + PartialEq + From<u8>,
    T::Err: std::fmt::Display,
{
    let value: T = lit.base10_parse()?;
    if value == T::from(0) {
        return Err(syn::Error::new_spanned(lit, "value must be greater than zero"));
    }
    Ok(value)
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options::default();
    if attr.is_empty() {
        return Ok(options);
    }
    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        options.secs = positive(&lit)?;
        return Ok(options);
    }

    let mut multi_thread = false;
    let mut workers = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            options.secs = positive(&lit)?;
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            match lit.value().as_str() {
                "current_thread" => multi_thread = false,
                "multi_thread" => multi_thread = true,
                other => {
                    return Err(syn::Error::new_spanned(
                        &lit,
                        format!("unknown flavor {other:?}; use current_thread or multi_thread"),
                    ))
                }
            }
            Ok(())
        } else if meta.path.is_ident("worker_threads") {
            let lit: LitInt = meta.value()?.parse()?;
            workers = Some(positive::<usize>(&lit)?);
            Ok(())
        } else {
            Err(meta.error("expected `secs`, `flavor` or `worker_threads`"))
        }
    });
    parser.parse(attr)?;

    options.flavor = match (multi_thread, workers) {
        (true, workers) => Flavor::MultiThread { workers },
        (false, None) => Flavor::CurrentThread,
        (false, Some(_)) => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "worker_threads requires flavor = \"multi_thread\"",
            ))
        }
    };
    Ok(options)
}

fn runtime_builder(flavor: Flavor) -> TokenStream2 {
    match flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread { workers: None } => {
            quote! { tokio::runtime::Builder::new_multi_thread() }
        }
        Flavor::MultiThread {
            workers: Some(workers),
        } => quote! {{
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.worker_threads(#workers);
            builder
        }},
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
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
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let secs = options.secs;
    let builder = runtime_builder(options.flavor);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(deadline, async move #block)
                            .await
                            .expect("test timed out");
                    });
                    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
                }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(deadline + std::time::Duration::from_secs(2)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
