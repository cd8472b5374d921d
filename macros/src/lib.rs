use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Runs a test function to completion on a single-loop [`tpcio::TpcEngine`].
///
/// Equivalent to building a one-loop engine, submitting the body as the
/// engine's startup task, and awaiting termination.
#[proc_macro_attribute]
pub fn loop_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);

    let attributes = &item.attrs;
    let visibility = &item.vis;
    let signature = &item.sig;
    let body = &item.block;

    let result = quote! {
        #(#attributes)*
        #visibility #signature {
            ::tpcio::testing::run_single_loop(move || #body);
        }
    };

    result.into()
}
