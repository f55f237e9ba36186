use crate::utils::apply_derives;
use proc_macro::TokenStream;
use quote::{ToTokens, quote};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    Generics, Ident, Item, LitStr, Result, Token, Type, parse::Parse, parse::ParseStream,
    parse_macro_input,
};

/// #[event] 宏实现
/// - 支持结构体与枚举
/// - 合并默认派生：Debug, Clone, serde::Serialize, serde::Deserialize
/// - 生成 `::pubsub_core::event::Event` 实现（EVENT_TYPE / lineage）
/// - 参数：`event_type = "..."`（默认类型名），`extends = Base`（父事件类型）
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as EventAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];

    let (ident, generics) = match &mut input {
        Item::Struct(s) => {
            apply_derives(&mut s.attrs, required);
            (s.ident.clone(), s.generics.clone())
        }
        Item::Enum(e) => {
            apply_derives(&mut e.attrs, required);
            (e.ident.clone(), e.generics.clone())
        }
        other => {
            return syn::Error::new(other.span(), "#[event] can only be used on struct or enum types")
                .to_compile_error()
                .into();
        }
    };

    let event_impl = impl_event(&ident, &generics, &cfg);

    quote! {
        #input
        #event_impl
    }
    .into()
}

fn impl_event(ident: &Ident, generics: &Generics, cfg: &EventAttrConfig) -> proc_macro2::TokenStream {
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let event_type = cfg
        .event_type
        .clone()
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));

    // 谱系：直接父类型在前，随后是父类型自身的谱系
    let lineage = match &cfg.extends {
        Some(base) => quote! {
            fn lineage() -> ::std::vec::Vec<&'static str> {
                let mut chain = ::std::vec![<#base as ::pubsub_core::event::Event>::EVENT_TYPE];
                chain.extend(<#base as ::pubsub_core::event::Event>::lineage());
                chain
            }
        },
        None => quote! {},
    };

    quote! {
        impl #impl_generics ::pubsub_core::event::Event for #ident #ty_generics #where_clause {
            const EVENT_TYPE: &'static str = #event_type;
            #lineage
        }
    }
}

// 宏参数：event_type / extends
struct EventAttrConfig {
    event_type: Option<LitStr>,
    extends: Option<Type>,
}

impl Parse for EventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut event_type: Option<LitStr> = None;
        let mut extends: Option<Type> = None;

        if input.is_empty() {
            return Ok(Self {
                event_type,
                extends,
            });
        }

        let pairs: Punctuated<syn::ExprAssign, Token![,]> =
            Punctuated::<syn::ExprAssign, Token![,]>::parse_terminated(input)?;

        for assign in pairs.into_iter() {
            let key_ident = match *assign.left {
                syn::Expr::Path(p) if p.path.segments.len() == 1 => {
                    p.path.segments[0].ident.clone()
                }
                other => return Err(syn::Error::new(other.span(), "invalid attribute key")),
            };
            match key_ident.to_string().as_str() {
                "event_type" => {
                    if event_type.is_some() {
                        return Err(syn::Error::new(
                            key_ident.span(),
                            "duplicate key 'event_type' in attribute",
                        ));
                    }
                    let lit: LitStr = syn::parse2(assign.right.to_token_stream())?;
                    if lit.value().trim().is_empty() {
                        return Err(syn::Error::new(lit.span(), "event_type must not be empty"));
                    }
                    event_type = Some(lit);
                }
                "extends" => {
                    if extends.is_some() {
                        return Err(syn::Error::new(
                            key_ident.span(),
                            "duplicate key 'extends' in attribute",
                        ));
                    }
                    let ty: Type = syn::parse2(assign.right.to_token_stream())?;
                    extends = Some(ty);
                }
                _ => {
                    return Err(syn::Error::new(
                        key_ident.span(),
                        "unknown key; expected 'event_type' | 'extends'",
                    ));
                }
            }
        }

        Ok(Self {
            event_type,
            extends,
        })
    }
}
