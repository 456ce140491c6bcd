// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`nicflow::sys::stat::StatProvider`] implementation
/// given a struct of named fields of type
/// [`nicflow::sys::stat::StatU64`].
///
/// ```ignore
/// #[derive(StatProvider)]
/// struct PortStats {
///     rx_pkts: StatU64,
///     flow_miss: StatU64,
/// }
/// ```
///
/// Alongside the trait impl, a plain `PortStatsSnap` struct with one
/// `u64` per counter is generated. It is what
/// [`StatProvider::snapshot()`] returns and what gets serialized
/// when stats are dumped.
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);

    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            _ => {
                return syn::Error::new(
                    ident.span(),
                    "a StatProvider must have named fields",
                )
                .to_compile_error()
                .into();
            }
        },

        _ => {
            return syn::Error::new(
                ident.span(),
                "only a struct may be a StatProvider",
            )
            .to_compile_error()
            .into();
        }
    };

    let num_fields = fields.len() as u32;
    let len = fields.len();
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(Clone, Debug, Default, PartialEq, Eq, ::serde::Serialize)]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl #ident_snap {
            /// The counter values, in declaration order.
            pub fn values(&self) -> [u64; #len] {
                [ #( self.#fields_ident, )* ]
            }
        }

        impl ::nicflow::sys::stat::StatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn new() -> Self {
                use ::nicflow::sys::stat::StatU64;

                Self {
                    #( #fields_ident: StatU64::new(), )*
                }
            }

            fn names() -> &'static [&'static str] {
                &[ #( stringify!(#fields_ident), )* ]
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }
        }
    };

    output.into()
}
