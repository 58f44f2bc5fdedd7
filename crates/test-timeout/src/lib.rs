//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` wraps an
//! async one in a fresh current-thread runtime. Both accept an optional
//! limit in seconds, e.g. `#[test_timeout::timeout(5)]`; the default is 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }
    func.sig.asyncness = None;

    let block = &func.block;
    let body = quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build test runtime")
            .block_on(async {
                tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            });
    };
    expand(func, limit, body, is_tokio_test).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let block: &Block = &func.block;
    let body = quote! { #block; };
    expand(func, limit, body, is_plain_test).into()
}

fn limit_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Runs `body` on a watchdog thread and fails the test if it neither
/// finishes nor panics within `limit` seconds. Panics are re-raised on the
/// test thread so assertion messages survive.
fn expand(
    func: ItemFn,
    limit: u64,
    body: TokenStream2,
    redundant: fn(&Attribute) -> bool,
) -> TokenStream2 {
    let ItemFn {
        attrs, vis, sig, ..
    } = func;
    let attrs = attrs.into_iter().filter(|attr| !redundant(attr));

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#limit);
            let (done, finished) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = done.send(outcome);
            });
            match finished.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

fn is_plain_test(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().map(|s| s.ident.to_string()).collect();
    segments == ["tokio", "test"]
}
