//! Serde support for expressions.
//!
//! Calls are serialized as (name, args); the hooks are restored from the
//! function registry on deserialization.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Func};

impl Serialize for Func {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Func", 2)?;
        st.serialize_field("name", self.name())?;
        st.serialize_field("args", self.args())?;
        st.end()
    }
}

impl<'de> Deserialize<'de> for Func {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "lowercase")]
        enum Field {
            Name,
            Args,
        }

        struct FuncVisitor;

        impl<'de> Visitor<'de> for FuncVisitor {
            type Value = Func;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a registered function call")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Func, A::Error> {
                let mut name: Option<String> = None;
                let mut args: Option<Vec<Expr>> = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Name => name = Some(map.next_value()?),
                        Field::Args => args = Some(map.next_value()?),
                    }
                }
                let name = name.ok_or_else(|| de::Error::missing_field("name"))?;
                let args = args.ok_or_else(|| de::Error::missing_field("args"))?;
                Func::from_name(&name, args)
                    .ok_or_else(|| de::Error::custom(format!("unregistered function '{}'", name)))
            }
        }

        deserializer.deserialize_struct("Func", &["name", "args"], FuncVisitor)
    }
}

#[cfg(test)]
mod tests {
    use crate::expr::func::{erf, sin};
    use crate::expr::{num, par, time, var, Expr};

    #[test]
    fn expression_round_trip() {
        let e = sin(var("x")) * par(0) + erf(var("y") - num(2.0)) / time();
        let json = serde_json::to_string(&e).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
