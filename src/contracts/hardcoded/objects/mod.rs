use crate::contracts::HardcodedContract;

const ENTRIES: &[HardcodedContract] = &[
    HardcodedContract::method(
        "java/util/Objects",
        "requireNonNull",
        "(Ljava/lang/Object;)Ljava/lang/Object;",
    )
    .contract("null -> fail; _ -> param1"),
    HardcodedContract::method(
        "java/util/Objects",
        "requireNonNull",
        "(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;",
    )
    .contract("null, _ -> fail; _, _ -> param1"),
    HardcodedContract::method(
        "java/util/Objects",
        "requireNonNull",
        "(Ljava/lang/Object;Ljava/util/function/Supplier;)Ljava/lang/Object;",
    )
    .contract("null, _ -> fail; _, _ -> param1"),
    HardcodedContract::method(
        "java/util/Objects",
        "requireNonNullElse",
        "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
    )
    .contract("!null, _ -> param1; null, !null -> param2; null, null -> fail")
    .pure(),
    HardcodedContract::method("java/util/Objects", "isNull", "(Ljava/lang/Object;)Z")
        .contract("null -> true; !null -> false")
        .pure(),
    HardcodedContract::method("java/util/Objects", "nonNull", "(Ljava/lang/Object;)Z")
        .contract("null -> false; !null -> true")
        .pure(),
    HardcodedContract::method(
        "java/util/Objects",
        "equals",
        "(Ljava/lang/Object;Ljava/lang/Object;)Z",
    )
    .contract("null, null -> true; null, !null -> false; !null, null -> false")
    .pure(),
    HardcodedContract::method(
        "java/util/Objects",
        "toString",
        "(Ljava/lang/Object;)Ljava/lang/String;",
    )
    .contract("_ -> !null")
    .pure(),
    HardcodedContract::method("*", "equals", "(Ljava/lang/Object;)Z")
        .contract("null -> false")
        .pure(),
    HardcodedContract::method("*", "hashCode", "()I").pure(),
    HardcodedContract::method("java/lang/Object", "<init>", "()V").pure(),
    HardcodedContract::method("java/lang/Object", "getClass", "()Ljava/lang/Class;")
        .pure()
        .not_null(),
    HardcodedContract::method(
        "java/lang/String",
        "valueOf",
        "(Ljava/lang/Object;)Ljava/lang/String;",
    )
    .contract("_ -> !null")
    .pure(),
    HardcodedContract::method("java/lang/String", "length", "()I").pure(),
    HardcodedContract::method("java/lang/String", "isEmpty", "()Z").pure(),
    HardcodedContract::method("java/lang/String", "trim", "()Ljava/lang/String;")
        .pure()
        .not_null(),
];

crate::register_contracts!("objects", ENTRIES);
