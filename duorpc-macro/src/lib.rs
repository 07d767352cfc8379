//! # duorpc procedural macros
//!
//! This crate provides the procedural macros for the duorpc RPC library.
//!
//! ## `#[interface]`
//!
//! Applied to a trait declaration, generates everything both endpoints need
//! to agree on the interface:
//! - the `METHODS` description table (name-derived identifiers, return
//!   shapes), validated for identifier collisions at compile time
//! - an `export()` method building the server-side dispatch table from an
//!   implementation
//! - client stubs implementing the trait on `duorpc::Connection`
//!
//! Methods come in three shapes:
//!
//! ```rust,ignore
//! #[duorpc::interface]
//! pub trait Calculator {
//!     async fn simple_sum(&self, a: i32, b: i32) -> Result<i32>; // awaited value
//!     async fn flush(&self) -> Result<()>;                       // awaited, no value
//!     fn send_event(&self, e: Event) -> Result<()>;              // fire-and-forget
//! }
//! ```
//!
//! ## `#[derive(Encode)]` / `#[derive(Decode)]`
//!
//! Wire-codec impls for user aggregates: struct fields encode in declaration
//! order; enums encode as a u16 tag (declaration index) followed by the
//! selected variant's fields.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, FnArg, GenericArgument, GenericParam, Generics, ItemTrait, Pat,
    PathArguments, ReturnType, TraitItem, TraitItemFn, Type, parse_macro_input, parse_quote,
};

const MAX_PARAMS: usize = 10;

/// Gets the correct path for referring to the duorpc crate.
///
/// Handles both the dependency case (`::duorpc`) and expansion inside the
/// duorpc workspace itself.
fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("duorpc") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        Ok(proc_macro_crate::FoundCrate::Itself) => quote! { ::duorpc },
        Err(_) => quote! { crate },
    }
}

enum Shape {
    Value(Box<Type>),
    Unit,
    Oneway,
}

struct Method {
    ident: syn::Ident,
    name: String,
    attrs: Vec<syn::Attribute>,
    args: Vec<(syn::Ident, Type)>,
    shape: Shape,
    index: usize,
}

/// The `T` of a `Result<T>` return type, if the signature has that form.
fn result_ok_type(output: &ReturnType) -> Option<Type> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Path(path) = &**ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    match &segment.arguments {
        PathArguments::AngleBracketed(args) if args.args.len() == 1 => {
            if let GenericArgument::Type(ok) = &args.args[0] {
                Some(ok.clone())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

/// The owning type decoded on the server side for an argument: borrowed views
/// become owning values, everything else is stored as declared.
fn storage_type(ty: &Type) -> Type {
    let Type::Reference(reference) = ty else {
        return ty.clone();
    };
    match &*reference.elem {
        Type::Path(path) if path.path.is_ident("str") => {
            parse_quote! { ::std::string::String }
        }
        Type::Slice(slice) => {
            let elem = &slice.elem;
            parse_quote! { ::std::vec::Vec<#elem> }
        }
        elem => elem.clone(),
    }
}

fn parse_method(method: &TraitItemFn, index: usize) -> Method {
    let ident = method.sig.ident.clone();
    if ident == "export" || ident == "NAME" || ident == "METHODS" {
        panic!("the method cannot be named `export`, `NAME` or `METHODS`");
    }

    let Some(receiver) = method.sig.receiver() else {
        panic!("interface method `{ident}` must take `&self`");
    };
    if receiver.reference.is_none() || receiver.mutability.is_some() {
        panic!("interface method `{ident}` must take `&self`");
    }

    let mut args = Vec::new();
    for input in method.sig.inputs.iter().skip(1) {
        let FnArg::Typed(arg) = input else {
            panic!("unexpected receiver in `{ident}`");
        };
        let Pat::Ident(pat) = &*arg.pat else {
            panic!("arguments of `{ident}` must be plain identifiers");
        };
        args.push((pat.ident.clone(), (*arg.ty).clone()));
    }
    if args.len() > MAX_PARAMS {
        panic!("`{ident}` declares {} parameters, the limit is {MAX_PARAMS}", args.len());
    }

    let Some(ok) = result_ok_type(&method.sig.output) else {
        panic!("`{ident}` must return `duorpc::Result<T>`");
    };
    let shape = if method.sig.asyncness.is_some() {
        if is_unit(&ok) { Shape::Unit } else { Shape::Value(Box::new(ok)) }
    } else {
        if !is_unit(&ok) {
            panic!("fire-and-forget method `{ident}` must return `duorpc::Result<()>`");
        }
        Shape::Oneway
    };

    Method {
        name: ident.to_string(),
        ident,
        attrs: method.attrs.clone(),
        args,
        shape,
        index,
    }
}

/// Generates one slot of the server dispatch table.
fn export_entry(
    method: &Method,
    krate: &proc_macro2::TokenStream,
    trait_ident: &syn::Ident,
) -> proc_macro2::TokenStream {
    let Method { ident, name, args, index, .. } = method;

    let arg_idents: Vec<_> = args.iter().map(|(ident, _)| ident).collect();
    let decodes: Vec<_> = args
        .iter()
        .map(|(ident, ty)| {
            let stored = storage_type(ty);
            quote! { let #ident = <#stored as #krate::Decode>::decode(&mut reader)?; }
        })
        .collect();
    // Borrowed argument views were decoded into owning storage; reborrow at
    // the call site.
    let pass: Vec<_> = args
        .iter()
        .map(|(ident, ty)| {
            if matches!(ty, Type::Reference(_)) {
                quote! { &#ident }
            } else {
                quote! { #ident }
            }
        })
        .collect();

    let payload = if args.is_empty() {
        quote! { _payload }
    } else {
        quote! { payload }
    };
    let make_reader = if args.is_empty() {
        quote! {}
    } else {
        quote! { let mut reader = #krate::Reader::with_state(&payload, state.as_ref()); }
    };

    match &method.shape {
        Shape::Value(ok) => quote! {
            {
                let this = ::std::sync::Arc::clone(&self);
                entries.push(#krate::MethodEntry::call(
                    <Self as #trait_ident>::METHODS[#index].id,
                    #name,
                    ::std::boxed::Box::new(move |#payload, state| {
                        let this = ::std::sync::Arc::clone(&this);
                        ::std::boxed::Box::pin(async move {
                            #make_reader
                            #(#decodes)*
                            let result = this.#ident(#(#pass),*).await?;
                            let mut writer = #krate::Writer::with_state(state);
                            <#ok as #krate::Encode>::encode(&result, &mut writer);
                            ::core::result::Result::Ok(writer.into_payload())
                        })
                    }),
                ));
            }
        },
        Shape::Unit => {
            let state = if args.is_empty() { quote! { _state } } else { quote! { state } };
            quote! {
                {
                    let this = ::std::sync::Arc::clone(&self);
                    entries.push(#krate::MethodEntry::call(
                        <Self as #trait_ident>::METHODS[#index].id,
                        #name,
                        ::std::boxed::Box::new(move |#payload, #state| {
                            let this = ::std::sync::Arc::clone(&this);
                            ::std::boxed::Box::pin(async move {
                                #make_reader
                                #(#decodes)*
                                this.#ident(#(#pass),*).await?;
                                ::core::result::Result::Ok(::std::vec::Vec::new())
                            })
                        }),
                    ));
                }
            }
        }
        Shape::Oneway => {
            let state = if args.is_empty() { quote! { _state } } else { quote! { state } };
            quote! {
                {
                    let this = ::std::sync::Arc::clone(&self);
                    entries.push(#krate::MethodEntry::oneway(
                        <Self as #trait_ident>::METHODS[#index].id,
                        #name,
                        ::std::boxed::Box::new(move |#payload, #state| {
                            #make_reader
                            #(#decodes)*
                            this.#ident(#(#pass),*)
                        }),
                    ));
                }
            }
        }
    }
}

/// Generates the client stub installed on `Connection`.
fn client_stub(
    method: &Method,
    krate: &proc_macro2::TokenStream,
    trait_ident: &syn::Ident,
) -> proc_macro2::TokenStream {
    let Method { ident, args, index, .. } = method;

    let params: Vec<_> = args
        .iter()
        .map(|(ident, ty)| quote! { #ident: #ty })
        .collect();
    let encodes: Vec<_> = args
        .iter()
        .map(|(ident, _)| quote! { #krate::Encode::encode(&#ident, &mut writer); })
        .collect();
    let make_writer = if args.is_empty() {
        quote! { let writer = self.writer(); }
    } else {
        quote! { let mut writer = self.writer(); }
    };

    match &method.shape {
        Shape::Value(ok) => quote! {
            fn #ident(&self, #(#params),*)
            -> impl ::core::future::Future<Output = #krate::Result<#ok>> + Send {
                async move {
                    #make_writer
                    #(#encodes)*
                    let reply = self.call(<Self as #trait_ident>::METHODS[#index].id, writer.into_payload()).await?;
                    let mut reader = self.reader(&reply);
                    <#ok as #krate::Decode>::decode(&mut reader)
                }
            }
        },
        Shape::Unit => quote! {
            fn #ident(&self, #(#params),*)
            -> impl ::core::future::Future<Output = #krate::Result<()>> + Send {
                async move {
                    #make_writer
                    #(#encodes)*
                    self.call(<Self as #trait_ident>::METHODS[#index].id, writer.into_payload()).await?;
                    ::core::result::Result::Ok(())
                }
            }
        },
        Shape::Oneway => quote! {
            fn #ident(&self, #(#params),*) -> #krate::Result<()> {
                #make_writer
                #(#encodes)*
                self.void_call(<Self as #trait_ident>::METHODS[#index].id, writer.into_payload())
            }
        },
    }
}

/// Procedural macro describing an RPC interface.
///
/// # Panics
///
/// Panics at compile time if a method does not match one of the three
/// supported shapes, takes more than ten parameters, or uses a reserved name.
#[proc_macro_attribute]
pub fn interface(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);
    if !input.generics.params.is_empty() {
        panic!("interface traits cannot be generic");
    }

    let trait_ident = &input.ident;
    let trait_name = trait_ident.to_string();
    let visibility = &input.vis;
    let attrs = &input.attrs;
    let krate = get_crate_name();

    let methods: Vec<Method> = input
        .items
        .iter()
        .map(|item| {
            let TraitItem::Fn(method) = item else {
                panic!("interface traits may only contain methods");
            };
            method
        })
        .enumerate()
        .map(|(index, method)| parse_method(method, index))
        .collect();
    if methods.is_empty() {
        panic!("interface must declare at least one method");
    }

    let descriptors: Vec<_> = methods
        .iter()
        .map(|method| {
            let name = &method.name;
            let shape = match method.shape {
                Shape::Value(_) => quote! { AsyncValue },
                Shape::Unit => quote! { AsyncUnit },
                Shape::Oneway => quote! { Oneway },
            };
            quote! { #krate::MethodDesc::new(#name, #krate::ReturnShape::#shape) }
        })
        .collect();

    let trait_methods: Vec<_> = methods
        .iter()
        .map(|method| {
            let Method { ident, args, attrs, .. } = method;
            let params: Vec<_> = args
                .iter()
                .map(|(ident, ty)| quote! { #ident: #ty })
                .collect();
            match &method.shape {
                Shape::Value(ok) => quote! {
                    #(#attrs)*
                    fn #ident(&self, #(#params),*)
                    -> impl ::core::future::Future<Output = #krate::Result<#ok>> + Send;
                },
                Shape::Unit => quote! {
                    #(#attrs)*
                    fn #ident(&self, #(#params),*)
                    -> impl ::core::future::Future<Output = #krate::Result<()>> + Send;
                },
                Shape::Oneway => quote! {
                    #(#attrs)*
                    fn #ident(&self, #(#params),*) -> #krate::Result<()>;
                },
            }
        })
        .collect();

    let entry_count = methods.len();
    let export_entries: Vec<_> =
        methods.iter().map(|m| export_entry(m, &krate, trait_ident)).collect();
    let client_stubs: Vec<_> =
        methods.iter().map(|m| client_stub(m, &krate, trait_ident)).collect();

    quote! {
        #(#attrs)*
        #visibility trait #trait_ident {
            const NAME: &'static str = #trait_name;

            /// Description of this interface: one entry per method, in
            /// declaration order. Validated for identifier collisions in
            /// const context.
            const METHODS: &'static [#krate::MethodDesc] =
                #krate::desc::checked(&[#(#descriptors),*]);

            #(#trait_methods)*

            /// Builds the server-side dispatch table over this
            /// implementation.
            fn export(self: ::std::sync::Arc<Self>) -> #krate::Dispatcher
            where
                Self: Sized + Send + Sync + 'static,
            {
                let mut entries = ::std::vec::Vec::with_capacity(#entry_count);
                #(#export_entries)*
                #krate::Dispatcher::new(entries)
            }
        }

        impl #trait_ident for #krate::Connection {
            #(#client_stubs)*
        }
    }
    .into()
}

fn add_trait_bounds(mut generics: Generics, bound: &proc_macro2::TokenStream) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(type_param) = param {
            type_param.bounds.push(parse_quote!(#bound));
        }
    }
    generics
}

/// Derives the wire-format encoder for a struct or enum.
#[proc_macro_derive(Encode)]
pub fn derive_encode(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let krate = get_crate_name();
    let ident = &input.ident;

    let trait_bound = quote! { #krate::Encode };
    let generics = add_trait_bounds(input.generics.clone(), &trait_bound);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(data) => encode_fields_of_self(&data.fields, &krate),
        Data::Enum(data) => {
            let arms: Vec<_> = data
                .variants
                .iter()
                .enumerate()
                .map(|(tag, variant)| {
                    let tag = tag as u16;
                    let variant_ident = &variant.ident;
                    let (pattern, field_idents) = variant_pattern(&variant.fields);
                    let encodes = field_idents
                        .iter()
                        .map(|field| quote! { #krate::Encode::encode(#field, w); });
                    quote! {
                        Self::#variant_ident #pattern => {
                            #krate::Encode::encode(&#tag, w);
                            #(#encodes)*
                        }
                    }
                })
                .collect();
            quote! { match self { #(#arms)* } }
        }
        Data::Union(_) => panic!("Encode cannot be derived for unions"),
    };

    quote! {
        #[automatically_derived]
        impl #impl_generics #krate::Encode for #ident #ty_generics #where_clause {
            fn encode(&self, w: &mut #krate::Writer) {
                #body
            }
        }
    }
    .into()
}

/// Derives the wire-format decoder for a struct or enum.
#[proc_macro_derive(Decode)]
pub fn derive_decode(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let krate = get_crate_name();
    let ident = &input.ident;
    let name = ident.to_string();

    let trait_bound = quote! { #krate::Decode };
    let generics = add_trait_bounds(input.generics.clone(), &trait_bound);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(data) => {
            let value = decode_fields(&data.fields, &krate, &quote! { Self });
            quote! { ::core::result::Result::Ok(#value) }
        }
        Data::Enum(data) => {
            let arms: Vec<_> = data
                .variants
                .iter()
                .enumerate()
                .map(|(tag, variant)| {
                    let tag = tag as u16;
                    let variant_ident = &variant.ident;
                    let value =
                        decode_fields(&variant.fields, &krate, &quote! { Self::#variant_ident });
                    quote! { #tag => ::core::result::Result::Ok(#value), }
                })
                .collect();
            quote! {
                let tag = <u16 as #krate::Decode>::decode(r)?;
                match tag {
                    #(#arms)*
                    _ => ::core::result::Result::Err(#krate::Error::new(
                        #krate::ErrorKind::DecodeFailed,
                        ::std::format!("invalid tag {tag} for {}", #name),
                    )),
                }
            }
        }
        Data::Union(_) => panic!("Decode cannot be derived for unions"),
    };

    quote! {
        #[automatically_derived]
        impl #impl_generics #krate::Decode for #ident #ty_generics #where_clause {
            fn decode(r: &mut #krate::Reader<'_>) -> #krate::Result<Self> {
                #body
            }
        }
    }
    .into()
}

/// Field-by-field encode of `self`, in declaration order.
fn encode_fields_of_self(
    fields: &Fields,
    krate: &proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    match fields {
        Fields::Named(named) => {
            let encodes = named.named.iter().map(|field| {
                let ident = &field.ident;
                quote! { #krate::Encode::encode(&self.#ident, w); }
            });
            quote! { #(#encodes)* }
        }
        Fields::Unnamed(unnamed) => {
            let encodes = (0..unnamed.unnamed.len()).map(|i| {
                let index = syn::Index::from(i);
                quote! { #krate::Encode::encode(&self.#index, w); }
            });
            quote! { #(#encodes)* }
        }
        Fields::Unit => quote! {},
    }
}

/// Match pattern binding every field of a variant, plus the bound idents.
fn variant_pattern(fields: &Fields) -> (proc_macro2::TokenStream, Vec<syn::Ident>) {
    match fields {
        Fields::Named(named) => {
            let idents: Vec<_> = named
                .named
                .iter()
                .map(|field| field.ident.clone().unwrap())
                .collect();
            (quote! { { #(#idents),* } }, idents)
        }
        Fields::Unnamed(unnamed) => {
            let idents: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("field{i}"))
                .collect();
            (quote! { ( #(#idents),* ) }, idents)
        }
        Fields::Unit => (quote! {}, Vec::new()),
    }
}

/// Constructor expression decoding every field of `path`, in order.
fn decode_fields(
    fields: &Fields,
    krate: &proc_macro2::TokenStream,
    path: &proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    match fields {
        Fields::Named(named) => {
            let decodes = named.named.iter().map(|field| {
                let ident = &field.ident;
                let ty = &field.ty;
                quote! { #ident: <#ty as #krate::Decode>::decode(r)? }
            });
            quote! { #path { #(#decodes),* } }
        }
        Fields::Unnamed(unnamed) => {
            let decodes = unnamed.unnamed.iter().map(|field| {
                let ty = &field.ty;
                quote! { <#ty as #krate::Decode>::decode(r)? }
            });
            quote! { #path ( #(#decodes),* ) }
        }
        Fields::Unit => quote! { #path },
    }
}
