use crate::contracts::HardcodedContract;

const GUAVA: &str = "com/google/common/base/Preconditions";

const ENTRIES: &[HardcodedContract] = &[
    HardcodedContract::method(GUAVA, "checkNotNull", "(Ljava/lang/Object;)Ljava/lang/Object;")
        .contract("null -> fail; _ -> param1"),
    HardcodedContract::method(
        GUAVA,
        "checkNotNull",
        "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
    )
    .contract("null, _ -> fail; _, _ -> param1"),
    HardcodedContract::method(
        GUAVA,
        "checkNotNull",
        "(Ljava/lang/Object;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;",
    )
    .contract("null, _, _ -> fail; _, _, _ -> param1"),
    HardcodedContract::method(GUAVA, "checkArgument", "(Z)V").contract("false -> fail"),
    HardcodedContract::method(GUAVA, "checkArgument", "(ZLjava/lang/Object;)V")
        .contract("false, _ -> fail"),
    HardcodedContract::method(
        GUAVA,
        "checkArgument",
        "(ZLjava/lang/String;[Ljava/lang/Object;)V",
    )
    .contract("false, _, _ -> fail"),
    HardcodedContract::method(GUAVA, "checkState", "(Z)V").contract("false -> fail"),
    HardcodedContract::method(GUAVA, "checkState", "(ZLjava/lang/Object;)V")
        .contract("false, _ -> fail"),
    HardcodedContract::method(
        "org/apache/commons/lang3/Validate",
        "notNull",
        "(Ljava/lang/Object;)Ljava/lang/Object;",
    )
    .contract("null -> fail; _ -> param1"),
    HardcodedContract::method("org/apache/commons/lang3/Validate", "isTrue", "(Z)V")
        .contract("false -> fail"),
    HardcodedContract::method("org/springframework/util/Assert", "notNull", "(Ljava/lang/Object;Ljava/lang/String;)V")
        .contract("null, _ -> fail"),
    HardcodedContract::method("org/springframework/util/Assert", "isTrue", "(ZLjava/lang/String;)V")
        .contract("false, _ -> fail"),
];

crate::register_contracts!("preconditions", ENTRIES);
