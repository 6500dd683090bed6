//! Test plugin, second version

fn add(x: i32, y: i32) -> i32 {
    x + y + 1
}

fn name_len(name: &str) -> usize {
    name.len() * 2
}

hotslot::export_fn!(Add: fn(i32, i32) -> i32 = add, capabilities = ["Adder"]);
hotslot::export_fn!(Greet: fn(&str) -> usize = name_len);
hotslot::export_value!(V: i32 = 43);
hotslot::export_value!(Label: &'static str = "add-v2");
