//! Implementation of `#[derive(FlowType)]`.
//!
//! The generated type id is either the struct name or the explicit
//! `#[flow_type(id = "...")]`. Both are fixed at compile time, unlike
//! `std::any::type_name()`, and the id is what the queue persists.

use crate::parsing::FlowTypeArgs;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

pub(crate) fn derive_flow_type_impl(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let args = FlowTypeArgs::from_input(input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let type_id = match &args.type_id {
        Some(id) => quote!(#id),
        None => quote!(stringify!(#name)),
    };

    let key = &args.business_key;

    let activities = &args.activities;
    let required = (!activities.is_empty()).then(|| {
        quote! {
            fn required_activities() -> &'static [&'static str] {
                const REQUIRED: &[&str] = &[
                    #(<#activities as ::ordo::executor::Activity>::NAME),*
                ];
                REQUIRED
            }
        }
    });

    let invokable = args.output.as_ref().map(|output| {
        quote! {
            #[automatically_derived]
            impl #impl_generics ::ordo::core::InvokableFlow for #name #ty_generics #where_clause {
                type Output = #output;
            }
        }
    });

    Ok(quote! {
        #[automatically_derived]
        impl #impl_generics ::ordo::core::FlowType for #name #ty_generics #where_clause {
            fn type_id() -> &'static str {
                #type_id
            }

            fn business_key(&self) -> ::std::string::String {
                ::std::string::ToString::to_string(&self.#(#key).*)
            }

            #required
        }

        #invokable
    })
}
