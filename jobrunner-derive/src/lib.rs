use proc_macro2::TokenStream;
use quote::{format_ident, quote, ToTokens};
use syn::{braced, parse::Parse, parse_macro_input};

/// Declares job payload types and a typed builder for their handlers.
///
/// ```ignore
/// jobrunner::job_handlers! {
///     struct Handlers {
///         send_email: SendEmail,
///         resize: ResizeImage,
///     }
/// }
///
/// let registry = Handlers::builder()
///     .with_send_email_handler(EmailHandler)
///     .with_resize_handler(ResizeHandler)
///     .build();
/// ```
#[proc_macro]
pub fn job_handlers(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let def = parse_macro_input!(input as HandlerSet);
    def.into_token_stream().into()
}

struct HandlerSet {
    _struct: syn::Token!(struct),
    iden: syn::Ident,
    _brace_token: syn::token::Brace,
    requests: syn::punctuated::Punctuated<Request, syn::Token![,]>,
}

impl Parse for HandlerSet {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let content;
        Ok(Self {
            _struct: input.parse()?,
            iden: input.parse()?,
            _brace_token: braced!(content in input),
            requests: content.parse_terminated(Request::parse)?,
        })
    }
}

impl ToTokens for HandlerSet {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let name = &self.iden;
        let builder_type_name = format_ident!("{}Builder", name);

        let impl_parameter = self.requests.iter().cloned().map(ImplParameter);
        let builder_methods = self.requests.iter().cloned().map(BuilderMethod);
        let ptypes = self.requests.iter().map(|req| req.name.to_string());

        tokens.extend(quote! {
            #(#impl_parameter)*

            pub struct #name;

            impl #name {
                pub fn builder() -> #builder_type_name {
                    #builder_type_name::new()
                }

                /// Payload types declared for this set.
                pub fn payload_types() -> &'static [&'static str] {
                    &[#(#ptypes),*]
                }
            }

            #[derive(Default)]
            pub struct #builder_type_name {
                registry: ::jobrunner::HandlerRegistry,
            }

            impl #builder_type_name {
                pub fn new() -> Self {
                    Self::default()
                }

                #(#builder_methods)*

                pub fn build(self) -> ::jobrunner::HandlerRegistry {
                    for ptype in #name::payload_types() {
                        if !self.registry.contains(ptype) {
                            ::jobrunner::tracing::warn!("No handler for job type {}", ptype);
                        }
                    }
                    self.registry
                }
            }
        })
    }
}

struct ImplParameter(Request);

impl ToTokens for ImplParameter {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let type_name = &self.0.input;
        let ptype = self.0.name.to_string();

        tokens.extend(quote! {
            impl ::jobrunner::JobParameter for #type_name {
                fn ptype() -> &'static str {
                    #ptype
                }
            }
        })
    }
}

struct BuilderMethod(Request);

impl ToTokens for BuilderMethod {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let name = &self.0.name;
        let input = &self.0.input;
        let method_name = format_ident!("with_{}_handler", name);
        let docs = format!(
            "Register the handler for [`{}`].\nIt is called for every job carrying a payload of this type.",
            input
        );

        tokens.extend(quote! {
            #[doc = #docs]
            pub fn #method_name<H>(mut self, handler: H) -> Self
            where
                H: ::jobrunner::JobHandler<Payload = #input>,
            {
                self.registry = self.registry.register(handler);
                self
            }
        })
    }
}

#[derive(Clone)]
struct Request {
    name: syn::Ident,
    _colon: syn::Token![:],
    input: syn::Ident,
}

impl Parse for Request {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        Ok(Self {
            name: input.parse()?,
            _colon: input.parse()?,
            input: input.parse()?,
        })
    }
}
