/// Builds [`QueryValues`](crate::query::QueryValues) from a list of expressions convertible
/// into [`Value`](crate::types::Value). Use `name => value` pairs for named values.
///
/// ```
/// use cqlkit::query_values;
///
/// let positional = query_values!(1, "text");
/// let named = query_values!("id" => 1, "name" => "text");
///
/// assert!(!positional.has_names());
/// assert!(named.has_names());
/// ```
#[macro_export]
macro_rules! query_values {
    ($($value:expr),* $(,)?) => {
        $crate::query::QueryValues::SimpleValues(
            vec![$(<$crate::types::Value as ::std::convert::From<_>>::from($value)),*]
        )
    };
    ($($name:expr => $value:expr),* $(,)?) => {
        $crate::query::QueryValues::NamedValues(
            [$(
                (
                    ::std::string::ToString::to_string(&$name),
                    <$crate::types::Value as ::std::convert::From<_>>::from($value),
                )
            ),*]
            .into_iter()
            .collect::<::std::collections::HashMap<_, _>>()
        )
    };
}
